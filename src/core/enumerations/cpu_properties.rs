use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::{EntityProvider, Observed},
    types::PalResult,
};

/// Source of `/proc/cpuinfo`.
pub trait CpuInfoDependencies: Send + Sync {
    fn cpuinfo(&self) -> PalResult<String>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcCpuInfoDependencies {
    fs: HostFs,
}

impl ProcCpuInfoDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl CpuInfoDependencies for ProcCpuInfoDependencies {
    fn cpuinfo(&self) -> PalResult<String> {
        self.fs.read_to_string("/proc/cpuinfo")
    }
}

/// One `processor` block of `/proc/cpuinfo`.
pub type CpuInfoBlock = HashMap<String, String>;

/// Splits `/proc/cpuinfo` into per-processor blocks.
pub fn parse_cpuinfo(content: &str) -> Vec<CpuInfoBlock> {
    let mut blocks = Vec::new();
    let mut current = CpuInfoBlock::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Properties of one physical processor package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuFacts {
    pub vendor: Option<String>,
    pub model_name: Option<String>,
    pub family: Option<u32>,
    pub model: Option<u32>,
    pub stepping: Option<u32>,
    /// Current clock of the first logical processor.
    pub clock_mhz: Option<f64>,
    /// Physical cores in the package.
    pub cores: Option<u32>,
    /// Logical processors seen for the package.
    pub logical_processors: u32,
    pub is_64bit: bool,
    pub hyperthreading: bool,
    /// VT-x or AMD-V present.
    pub virtualization: bool,
}

impl CpuFacts {
    fn from_block(block: &CpuInfoBlock, logical_processors: u32) -> Self {
        let number = |key: &str| block.get(key).and_then(|v| v.parse::<u32>().ok());
        let flags: Vec<&str> = block
            .get("flags")
            .map(|f| f.split_whitespace().collect())
            .unwrap_or_default();
        let cores = number("cpu cores");
        let siblings = number("siblings");

        Self {
            vendor: block.get("vendor_id").cloned(),
            model_name: block
                .get("model name")
                .or_else(|| block.get("Processor"))
                .cloned(),
            family: number("cpu family"),
            model: number("model"),
            stepping: number("stepping"),
            clock_mhz: block.get("cpu MHz").and_then(|v| v.parse().ok()),
            cores,
            logical_processors,
            is_64bit: flags.contains(&"lm"),
            hyperthreading: matches!((siblings, cores), (Some(s), Some(c)) if s > c),
            virtualization: flags.iter().any(|f| *f == "vmx" || *f == "svm"),
        }
    }
}

/// Groups cpuinfo blocks by `physical id`, falling back to one group per
/// logical processor when the kernel does not report packages.
pub fn group_processors(blocks: &[CpuInfoBlock]) -> IndexMap<String, (&CpuInfoBlock, u32)> {
    let mut groups: IndexMap<String, (&CpuInfoBlock, u32)> = IndexMap::new();
    for (index, block) in blocks.iter().enumerate() {
        let id = match block.get("physical id") {
            Some(physical) => format!("CPU {}", physical),
            None => format!(
                "processor {}",
                block
                    .get("processor")
                    .cloned()
                    .unwrap_or_else(|| index.to_string())
            ),
        };
        groups
            .entry(id)
            .and_modify(|(_, count)| *count += 1)
            .or_insert((block, 1));
    }
    groups
}

pub struct CpuPropertiesInstance {
    state: InstanceState,
    facts: CpuFacts,
}

impl EntityInstance for CpuPropertiesInstance {
    type Facts = CpuFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &CpuFacts {
        &self.facts
    }
}

/// One instance per processor package; facts arrive with each discovery.
pub struct CpuPropertiesProvider {
    deps: Arc<dyn CpuInfoDependencies>,
}

impl CpuPropertiesProvider {
    pub fn new(deps: Arc<dyn CpuInfoDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for CpuPropertiesProvider {
    type Instance = CpuPropertiesInstance;
    type Observation = CpuFacts;
    const NAME: &'static str = "cpu_properties";

    /// An unreadable or empty cpuinfo is fatal.
    fn discover(&mut self) -> PalResult<Option<Vec<Observed<CpuFacts>>>> {
        let content = self.deps.cpuinfo()?;
        let blocks = parse_cpuinfo(&content);
        if blocks.is_empty() {
            return Err(ErrorKind::InvalidFormat {
                location: "/proc/cpuinfo".to_string(),
                reason: "no processor entries".to_string(),
            }
            .into());
        }

        Ok(Some(
            group_processors(&blocks)
                .into_iter()
                .map(|(id, (block, count))| Observed::new(id, CpuFacts::from_block(block, count)))
                .collect(),
        ))
    }

    fn create(&mut self, observed: Observed<CpuFacts>) -> PalResult<Option<CpuPropertiesInstance>> {
        Ok(Some(CpuPropertiesInstance {
            state: InstanceState::new(observed.id),
            facts: observed.observation,
        }))
    }

    fn refresh(&mut self, instance: &mut CpuPropertiesInstance, facts: CpuFacts) {
        instance.facts = facts;
    }
}

pub type CpuPropertiesEnumeration = Enumeration<CpuPropertiesProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-cpu-properties"))]
crate::register_enumeration!("cpu_properties", |ctx| {
    let deps = ProcCpuInfoDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(CpuPropertiesEnumeration::new(
        CpuPropertiesProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
