use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::EntityProvider,
    types::PalResult,
};

/// Raw operating system data source.
pub trait OsDependencies: Send + Sync {
    /// Contents of `os-release`, `None` when the distribution ships none.
    fn os_release(&self) -> Option<String>;

    /// Kernel type, release and version strings.
    fn kernel(&self) -> KernelInfo;

    fn hostname(&self) -> Option<String>;

    /// Seconds since boot.
    fn uptime(&self) -> PalResult<f64>;

    fn architecture(&self) -> String;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub os_type: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
}

/// Reads OS identity from `/etc/os-release` and `/proc/sys/kernel`.
#[derive(Debug, Clone, Default)]
pub struct LinuxOsDependencies {
    fs: HostFs,
}

impl LinuxOsDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl OsDependencies for LinuxOsDependencies {
    fn os_release(&self) -> Option<String> {
        self.fs
            .read_to_string("/etc/os-release")
            .or_else(|_| self.fs.read_to_string("/usr/lib/os-release"))
            .ok()
    }

    fn kernel(&self) -> KernelInfo {
        KernelInfo {
            os_type: self.fs.read_attribute("/proc/sys/kernel/ostype"),
            release: self.fs.read_attribute("/proc/sys/kernel/osrelease"),
            version: self.fs.read_attribute("/proc/sys/kernel/version"),
        }
    }

    fn hostname(&self) -> Option<String> {
        self.fs.read_attribute("/proc/sys/kernel/hostname")
    }

    fn uptime(&self) -> PalResult<f64> {
        let content = self.fs.read_to_string("/proc/uptime")?;
        parse_uptime(&content)
    }

    fn architecture(&self) -> String {
        std::env::consts::ARCH.to_string()
    }
}

/// First field of `/proc/uptime`.
pub fn parse_uptime(content: &str) -> PalResult<f64> {
    let field = content.split_whitespace().next().ok_or_else(|| ErrorKind::MissingField {
        field: "uptime".to_string(),
        location: "/proc/uptime".to_string(),
    })?;
    let seconds = field.parse::<f64>().map_err(|e| ErrorKind::ParseError {
        metric: "uptime".to_string(),
        location: "/proc/uptime".to_string(),
        reason: e.to_string(),
    })?;
    Ok(seconds)
}

/// Parses `KEY=value` lines, unquoting values and skipping comments.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsFacts {
    /// Human readable distribution name (`PRETTY_NAME`).
    pub caption: Option<String>,
    /// Distribution id (`ID`).
    pub distribution: Option<String>,
    pub version: Option<String>,
    pub kernel: KernelInfo,
    pub hostname: Option<String>,
    pub architecture: String,
    pub uptime_secs: u64,
    /// RFC 3339 boot time derived from the uptime.
    pub last_boot_time: Option<String>,
}

/// The total OS instance.
pub struct OsInstance {
    state: InstanceState,
    deps: Arc<dyn OsDependencies>,
    facts: OsFacts,
}

impl OsInstance {
    pub fn new(deps: Arc<dyn OsDependencies>) -> Self {
        Self {
            state: InstanceState::total(),
            deps,
            facts: OsFacts::default(),
        }
    }
}

impl EntityInstance for OsInstance {
    type Facts = OsFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &OsFacts {
        &self.facts
    }

    fn update(&mut self) -> PalResult<()> {
        let uptime = self.deps.uptime()?;
        let release = self
            .deps
            .os_release()
            .map(|content| parse_os_release(&content))
            .unwrap_or_default();

        let boot = OffsetDateTime::now_utc() - Duration::seconds_f64(uptime);
        self.facts = OsFacts {
            caption: release
                .get("PRETTY_NAME")
                .or_else(|| release.get("NAME"))
                .cloned(),
            distribution: release.get("ID").cloned(),
            version: release
                .get("VERSION_ID")
                .or_else(|| release.get("VERSION"))
                .cloned(),
            kernel: self.deps.kernel(),
            hostname: self.deps.hostname(),
            architecture: self.deps.architecture(),
            uptime_secs: uptime as u64,
            last_boot_time: boot.format(&Rfc3339).ok(),
        };
        Ok(())
    }
}

pub struct OsProvider {
    deps: Arc<dyn OsDependencies>,
}

impl OsProvider {
    pub fn new(deps: Arc<dyn OsDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for OsProvider {
    type Instance = OsInstance;
    type Observation = ();
    const NAME: &'static str = "os";

    fn total_instance(&mut self) -> PalResult<Option<OsInstance>> {
        Ok(Some(OsInstance::new(self.deps.clone())))
    }

    fn seed_on_init(&self) -> bool {
        true
    }
}

pub type OsEnumeration = Enumeration<OsProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-os"))]
crate::register_enumeration!("os", |ctx| {
    let deps = LinuxOsDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(OsEnumeration::new(OsProvider::new(Arc::new(deps)), &ctx.logs))
});
