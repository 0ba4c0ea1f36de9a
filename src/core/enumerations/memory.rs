use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::EntityProvider,
    types::PalResult,
};

/// Raw memory data source.
pub trait MemoryDependencies: Send + Sync {
    /// Contents of `/proc/meminfo`.
    fn meminfo(&self) -> PalResult<String>;

    /// Contents of `/proc/vmstat`.
    fn vmstat(&self) -> PalResult<String>;
}

/// Reads memory counters from procfs.
#[derive(Debug, Clone, Default)]
pub struct ProcMemoryDependencies {
    fs: HostFs,
}

impl ProcMemoryDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl MemoryDependencies for ProcMemoryDependencies {
    fn meminfo(&self) -> PalResult<String> {
        self.fs.read_to_string("/proc/meminfo")
    }

    fn vmstat(&self) -> PalResult<String> {
        self.fs.read_to_string("/proc/vmstat")
    }
}

/// System-wide memory facts. Sizes are in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFacts {
    /// Total physical RAM visible to the kernel.
    pub total_physical_bytes: u64,
    /// Memory available for new allocations without swapping.
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_swap_bytes: u64,
    pub available_swap_bytes: u64,
    pub used_swap_bytes: u64,
    /// Pages paged in since boot, absent when `/proc/vmstat` is unreadable.
    pub pages_in: Option<u64>,
    pub pages_out: Option<u64>,
}

/// Parses the `Key:   value kB` lines of `/proc/meminfo` into bytes.
pub fn parse_meminfo(content: &str) -> HashMap<&str, u64> {
    let mut values = HashMap::with_capacity(64);
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(Ok(value)) = parts.next().map(str::parse::<u64>) else {
            continue;
        };
        let bytes = match parts.next() {
            Some("kB") => value.saturating_mul(1024),
            _ => value,
        };
        values.insert(key.trim(), bytes);
    }
    values
}

fn vmstat_counter(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (name, value) = line.split_once(' ')?;
        (name == key).then(|| value.trim().parse().ok()).flatten()
    })
}

fn compute_facts(meminfo: &str, vmstat: Option<&str>) -> PalResult<MemoryFacts> {
    let values = parse_meminfo(meminfo);
    let field = |name: &str| values.get(name).copied();

    let total = field("MemTotal").ok_or_else(|| ErrorKind::MissingField {
        field: "MemTotal".to_string(),
        location: "/proc/meminfo".to_string(),
    })?;
    // Kernels before 3.14 have no MemAvailable.
    let available = field("MemAvailable").unwrap_or_else(|| {
        field("MemFree").unwrap_or(0) + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
    });
    let available = available.min(total);
    let swap_total = field("SwapTotal").unwrap_or(0);
    let swap_free = field("SwapFree").unwrap_or(0).min(swap_total);

    Ok(MemoryFacts {
        total_physical_bytes: total,
        available_bytes: available,
        used_bytes: total - available,
        total_swap_bytes: swap_total,
        available_swap_bytes: swap_free,
        used_swap_bytes: swap_total - swap_free,
        pages_in: vmstat.and_then(|v| vmstat_counter(v, "pgpgin")),
        pages_out: vmstat.and_then(|v| vmstat_counter(v, "pgpgout")),
    })
}

/// The total memory instance.
pub struct MemoryInstance {
    state: InstanceState,
    deps: Arc<dyn MemoryDependencies>,
    facts: MemoryFacts,
}

impl MemoryInstance {
    pub fn new(deps: Arc<dyn MemoryDependencies>) -> Self {
        Self {
            state: InstanceState::total(),
            deps,
            facts: MemoryFacts::default(),
        }
    }
}

impl EntityInstance for MemoryInstance {
    type Facts = MemoryFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &MemoryFacts {
        &self.facts
    }

    fn update(&mut self) -> PalResult<()> {
        let meminfo = self.deps.meminfo()?;
        // Paging counters are optional extras.
        let vmstat = self.deps.vmstat().ok();
        self.facts = compute_facts(&meminfo, vmstat.as_deref())?;
        Ok(())
    }
}

/// Memory has no per-item instances, only the total.
pub struct MemoryProvider {
    deps: Arc<dyn MemoryDependencies>,
}

impl MemoryProvider {
    pub fn new(deps: Arc<dyn MemoryDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for MemoryProvider {
    type Instance = MemoryInstance;
    type Observation = ();
    const NAME: &'static str = "memory";

    fn total_instance(&mut self) -> PalResult<Option<MemoryInstance>> {
        Ok(Some(MemoryInstance::new(self.deps.clone())))
    }

    fn seed_on_init(&self) -> bool {
        true
    }
}

pub type MemoryEnumeration = Enumeration<MemoryProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-memory"))]
crate::register_enumeration!("memory", |ctx| {
    let deps = ProcMemoryDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(MemoryEnumeration::new(
        MemoryProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
