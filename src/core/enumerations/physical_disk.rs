use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    policy::{ExpectedKinds, FailurePolicy},
    traits::{EntityProvider, Observed},
    types::PalResult,
};

/// Sector size used by the `size` attribute regardless of the device.
const SECTOR_SIZE: u64 = 512;

/// Virtual block devices that never back physical storage.
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "nbd"];

pub fn is_virtual_device(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Block device source.
pub trait PhysicalDiskDependencies: Send + Sync {
    /// Kernel names of the block devices present, e.g. `sda`, `nvme0n1`.
    fn block_devices(&self) -> PalResult<Vec<String>>;

    /// Whether the device is still present.
    fn exists(&self, device: &str) -> bool;

    /// A sysfs attribute relative to the device directory, e.g. `size` or
    /// `device/model`.
    fn attribute(&self, device: &str, name: &str) -> Option<String>;
}

/// Reads `/sys/block`.
#[derive(Debug, Clone, Default)]
pub struct SysfsBlockDependencies {
    fs: HostFs,
}

impl SysfsBlockDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl PhysicalDiskDependencies for SysfsBlockDependencies {
    fn block_devices(&self) -> PalResult<Vec<String>> {
        self.fs.read_dir_names("/sys/block")
    }

    fn exists(&self, device: &str) -> bool {
        self.fs.exists(&format!("/sys/block/{}", device))
    }

    fn attribute(&self, device: &str, name: &str) -> Option<String> {
        self.fs.read_attribute(&format!("/sys/block/{}/{}", device, name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalDiskFacts {
    /// Device node, e.g. `/dev/sda`.
    pub device_path: String,
    pub size_bytes: Option<u64>,
    pub logical_block_size: Option<u64>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub serial: Option<String>,
    pub removable: bool,
    /// `None` when the kernel does not report the queue type.
    pub rotational: Option<bool>,
    pub cdrom: bool,
}

pub struct PhysicalDiskInstance {
    state: InstanceState,
    deps: Arc<dyn PhysicalDiskDependencies>,
    facts: PhysicalDiskFacts,
}

impl PhysicalDiskInstance {
    fn new(deps: Arc<dyn PhysicalDiskDependencies>, device: String) -> Self {
        Self {
            facts: PhysicalDiskFacts {
                device_path: format!("/dev/{}", device),
                cdrom: device.starts_with("sr"),
                ..Default::default()
            },
            state: InstanceState::new(device),
            deps,
        }
    }
}

impl EntityInstance for PhysicalDiskInstance {
    type Facts = PhysicalDiskFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &PhysicalDiskFacts {
        &self.facts
    }

    /// A device detached between discovery and update reports `PathNotFound`.
    fn update(&mut self) -> PalResult<()> {
        let device = self.state.id();
        if !self.deps.exists(device) {
            return Err(ErrorKind::PathNotFound {
                path: format!("/sys/block/{}", device),
            }
            .into());
        }

        let deps = &self.deps;
        let number = |name: &str| deps.attribute(device, name).and_then(|v| v.parse::<u64>().ok());
        let flag = |name: &str| deps.attribute(device, name).map(|v| v == "1");

        self.facts.size_bytes = number("size").map(|sectors| sectors.saturating_mul(SECTOR_SIZE));
        self.facts.logical_block_size = number("queue/logical_block_size");
        self.facts.model = deps.attribute(device, "device/model");
        self.facts.vendor = deps.attribute(device, "device/vendor");
        self.facts.serial = deps
            .attribute(device, "device/serial")
            .or_else(|| deps.attribute(device, "serial"));
        self.facts.removable = flag("removable").unwrap_or(false);
        self.facts.rotational = flag("queue/rotational");
        Ok(())
    }
}

/// One instance per physical block device, keyed by kernel name.
pub struct PhysicalDiskProvider {
    deps: Arc<dyn PhysicalDiskDependencies>,
}

impl PhysicalDiskProvider {
    pub fn new(deps: Arc<dyn PhysicalDiskDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for PhysicalDiskProvider {
    type Instance = PhysicalDiskInstance;
    type Observation = ();
    const NAME: &'static str = "physical_disk";

    fn discover(&mut self) -> PalResult<Option<Vec<Observed<()>>>> {
        Ok(Some(
            self.deps
                .block_devices()?
                .into_iter()
                .filter(|name| !is_virtual_device(name))
                .map(|name| Observed::new(name, ()))
                .collect(),
        ))
    }

    fn create(&mut self, observed: Observed<()>) -> PalResult<Option<PhysicalDiskInstance>> {
        Ok(Some(PhysicalDiskInstance::new(self.deps.clone(), observed.id)))
    }

    fn failure_policy(&self) -> Box<dyn FailurePolicy> {
        Box::new(ExpectedKinds)
    }
}

pub type PhysicalDiskEnumeration = Enumeration<PhysicalDiskProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-physical-disk"))]
crate::register_enumeration!("physical_disk", |ctx| {
    let deps = SysfsBlockDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(PhysicalDiskEnumeration::new(
        PhysicalDiskProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
