use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::EntityProvider,
    types::PalResult,
};

/// DMI attribute source. Attributes missing on the platform yield `None`.
pub trait BiosDependencies: Send + Sync {
    fn dmi_attribute(&self, name: &str) -> Option<String>;
}

/// Reads `/sys/class/dmi/id/<name>`.
#[derive(Debug, Clone, Default)]
pub struct SysfsDmiDependencies {
    fs: HostFs,
}

impl SysfsDmiDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl BiosDependencies for SysfsDmiDependencies {
    fn dmi_attribute(&self, name: &str) -> Option<String> {
        self.fs.read_attribute(&format!("/sys/class/dmi/id/{}", name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiosFacts {
    pub manufacturer: Option<String>,
    pub version: Option<String>,
    /// Release date as `YYYY-MM-DD`.
    pub release_date: Option<String>,
    pub major_version: Option<u8>,
    pub minor_version: Option<u8>,
}

/// Converts the SMBIOS `MM/DD/YYYY` date into `YYYY-MM-DD`.
///
/// Other shapes are returned unchanged.
pub fn normalize_release_date(raw: &str) -> String {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [month, day, year]
            if month.len() == 2
                && day.len() == 2
                && year.len() == 4
                && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())) =>
        {
            format!("{}-{}-{}", year, month, day)
        }
        _ => raw.to_string(),
    }
}

/// Splits the `bios_release` attribute (`5.17`) into major and minor numbers.
pub fn parse_release(raw: &str) -> (Option<u8>, Option<u8>) {
    let mut parts = raw.split('.');
    let major = parts.next().and_then(|p| p.trim().parse().ok());
    let minor = parts.next().and_then(|p| p.trim().parse().ok());
    (major, minor)
}

/// The total BIOS instance.
pub struct BiosInstance {
    state: InstanceState,
    deps: Arc<dyn BiosDependencies>,
    facts: BiosFacts,
}

impl BiosInstance {
    pub fn new(deps: Arc<dyn BiosDependencies>) -> Self {
        Self {
            state: InstanceState::total(),
            deps,
            facts: BiosFacts::default(),
        }
    }
}

impl EntityInstance for BiosInstance {
    type Facts = BiosFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &BiosFacts {
        &self.facts
    }

    /// Absent attributes are normal on virtual machines and containers, so
    /// this never fails.
    fn update(&mut self) -> PalResult<()> {
        let (major_version, minor_version) = self
            .deps
            .dmi_attribute("bios_release")
            .map(|r| parse_release(&r))
            .unwrap_or((None, None));

        self.facts = BiosFacts {
            manufacturer: self.deps.dmi_attribute("bios_vendor"),
            version: self.deps.dmi_attribute("bios_version"),
            release_date: self
                .deps
                .dmi_attribute("bios_date")
                .map(|d| normalize_release_date(&d)),
            major_version,
            minor_version,
        };
        Ok(())
    }
}

pub struct BiosProvider {
    deps: Arc<dyn BiosDependencies>,
}

impl BiosProvider {
    pub fn new(deps: Arc<dyn BiosDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for BiosProvider {
    type Instance = BiosInstance;
    type Observation = ();
    const NAME: &'static str = "bios";

    fn total_instance(&mut self) -> PalResult<Option<BiosInstance>> {
        Ok(Some(BiosInstance::new(self.deps.clone())))
    }
}

pub type BiosEnumeration = Enumeration<BiosProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-bios"))]
crate::register_enumeration!("bios", |ctx| {
    let deps = SysfsDmiDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(BiosEnumeration::new(BiosProvider::new(Arc::new(deps)), &ctx.logs))
});
