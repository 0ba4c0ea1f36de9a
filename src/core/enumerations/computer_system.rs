use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::EntityProvider,
    types::PalResult,
};

/// Identity data source for the machine as a whole.
pub trait ComputerSystemDependencies: Send + Sync {
    fn dmi_attribute(&self, name: &str) -> Option<String>;

    fn hostname(&self) -> Option<String>;

    fn domain_name(&self) -> Option<String>;

    /// Contents of `/proc/cpuinfo`.
    fn cpuinfo(&self) -> PalResult<String>;

    fn architecture(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct LinuxComputerSystemDependencies {
    fs: HostFs,
}

impl LinuxComputerSystemDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl ComputerSystemDependencies for LinuxComputerSystemDependencies {
    fn dmi_attribute(&self, name: &str) -> Option<String> {
        self.fs.read_attribute(&format!("/sys/class/dmi/id/{}", name))
    }

    fn hostname(&self) -> Option<String> {
        self.fs.read_attribute("/proc/sys/kernel/hostname")
    }

    fn domain_name(&self) -> Option<String> {
        self.fs
            .read_attribute("/proc/sys/kernel/domainname")
            .filter(|d| d != "(none)")
    }

    fn cpuinfo(&self) -> PalResult<String> {
        self.fs.read_to_string("/proc/cpuinfo")
    }

    fn architecture(&self) -> String {
        std::env::consts::ARCH.to_string()
    }
}

/// SMBIOS chassis type names, indexed by code.
const CHASSIS_TYPES: &[&str] = &[
    "Unknown",
    "Other",
    "Unknown",
    "Desktop",
    "Low Profile Desktop",
    "Pizza Box",
    "Mini Tower",
    "Tower",
    "Portable",
    "Laptop",
    "Notebook",
    "Hand Held",
    "Docking Station",
    "All in One",
    "Sub Notebook",
    "Space-saving",
    "Lunch Box",
    "Main Server Chassis",
    "Expansion Chassis",
    "SubChassis",
    "Bus Expansion Chassis",
    "Peripheral Chassis",
    "RAID Chassis",
    "Rack Mount Chassis",
    "Sealed-case PC",
    "Multi-system chassis",
    "Compact PCI",
    "Advanced TCA",
    "Blade",
    "Blade Enclosure",
    "Tablet",
    "Convertible",
    "Detachable",
    "IoT Gateway",
    "Embedded PC",
    "Mini PC",
    "Stick PC",
];

pub fn chassis_name(code: u8) -> &'static str {
    CHASSIS_TYPES.get(code as usize).copied().unwrap_or("Unknown")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputerSystemFacts {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub uuid: Option<String>,
    pub chassis: Option<String>,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub architecture: String,
    pub logical_processors: usize,
}

/// The total computer system instance.
pub struct ComputerSystemInstance {
    state: InstanceState,
    deps: Arc<dyn ComputerSystemDependencies>,
    facts: ComputerSystemFacts,
}

impl ComputerSystemInstance {
    pub fn new(deps: Arc<dyn ComputerSystemDependencies>) -> Self {
        Self {
            state: InstanceState::total(),
            deps,
            facts: ComputerSystemFacts::default(),
        }
    }
}

impl EntityInstance for ComputerSystemInstance {
    type Facts = ComputerSystemFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &ComputerSystemFacts {
        &self.facts
    }

    fn update(&mut self) -> PalResult<()> {
        let cpuinfo = self.deps.cpuinfo()?;
        let logical_processors = cpuinfo
            .lines()
            .filter(|line| {
                line.split_once(':')
                    .is_some_and(|(key, _)| key.trim() == "processor")
            })
            .count();

        let deps = &self.deps;
        self.facts = ComputerSystemFacts {
            manufacturer: deps.dmi_attribute("sys_vendor"),
            model: deps.dmi_attribute("product_name"),
            version: deps.dmi_attribute("product_version"),
            uuid: deps.dmi_attribute("product_uuid"),
            chassis: deps
                .dmi_attribute("chassis_type")
                .and_then(|c| c.parse::<u8>().ok())
                .map(|c| chassis_name(c).to_string()),
            hostname: deps.hostname(),
            domain: deps.domain_name(),
            architecture: deps.architecture(),
            logical_processors,
        };
        Ok(())
    }
}

pub struct ComputerSystemProvider {
    deps: Arc<dyn ComputerSystemDependencies>,
}

impl ComputerSystemProvider {
    pub fn new(deps: Arc<dyn ComputerSystemDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for ComputerSystemProvider {
    type Instance = ComputerSystemInstance;
    type Observation = ();
    const NAME: &'static str = "computer_system";

    fn total_instance(&mut self) -> PalResult<Option<ComputerSystemInstance>> {
        Ok(Some(ComputerSystemInstance::new(self.deps.clone())))
    }
}

pub type ComputerSystemEnumeration = Enumeration<ComputerSystemProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-computer-system"))]
crate::register_enumeration!("computer_system", |ctx| {
    let deps = LinuxComputerSystemDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(ComputerSystemEnumeration::new(
        ComputerSystemProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
