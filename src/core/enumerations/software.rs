use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::{ErrorKind, PalError},
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    policy::{FailureClass, FailurePolicy},
    traits::{EntityProvider, Observed},
    types::PalResult,
};

/// `Status:` value of a fully installed dpkg package.
const INSTALLED: &str = "install ok installed";

/// One stanza of the dpkg status database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageRecord {
    pub fields: HashMap<String, String>,
}

impl PackageRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("Package")
    }

    pub fn is_installed(&self) -> bool {
        self.get("Status") == Some(INSTALLED)
    }
}

/// Splits a dpkg status file into stanzas.
///
/// Continuation lines (leading whitespace) are appended to the previous field.
pub fn parse_dpkg_status(content: &str) -> Vec<PackageRecord> {
    let mut records = Vec::new();
    let mut current = PackageRecord::default();
    let mut last_field: Option<String> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.fields.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            last_field = None;
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(value) = last_field.as_ref().and_then(|f| current.fields.get_mut(f)) {
                value.push('\n');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            current.fields.insert(key.clone(), value.trim().to_string());
            last_field = Some(key);
        }
    }
    if !current.fields.is_empty() {
        records.push(current);
    }
    records
}

/// Splits a Debian version (`[epoch:]upstream[-revision]`) into the leading
/// major and minor numbers of the upstream part.
pub fn version_numbers(version: &str) -> (Option<u32>, Option<u32>) {
    let upstream = version.split_once(':').map_or(version, |(_, rest)| rest);
    let mut parts = upstream.split(|c: char| !c.is_ascii_digit());
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    (major, minor)
}

/// Package database access.
pub trait SoftwareDependencies: Send + Sync {
    /// Names of the installed packages.
    fn installed_ids(&self) -> PalResult<Vec<String>>;

    /// The record for `id`, `None` once the package is gone.
    fn package(&self, id: &str) -> PalResult<Option<PackageRecord>>;

    /// Drops any cached database state.
    fn clean_up(&self) {}
}

/// Reads the dpkg status database, caching the installed records between
/// discovery passes.
#[derive(Debug)]
pub struct DpkgStatusDependencies {
    fs: HostFs,
    status_file: String,
    cache: Mutex<HashMap<String, PackageRecord>>,
}

impl DpkgStatusDependencies {
    pub fn new(fs: HostFs, status_file: impl Into<String>) -> Self {
        Self {
            fs,
            status_file: status_file.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn reload(&self) -> PalResult<Vec<String>> {
        let content = self.fs.read_to_string(&self.status_file)?;
        let mut ids = Vec::new();
        let mut installed = HashMap::new();
        for record in parse_dpkg_status(&content) {
            if !record.is_installed() {
                continue;
            }
            if let Some(name) = record.name() {
                let name = name.to_string();
                ids.push(name.clone());
                installed.insert(name, record);
            }
        }
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = installed;
        Ok(ids)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl SoftwareDependencies for DpkgStatusDependencies {
    fn installed_ids(&self) -> PalResult<Vec<String>> {
        self.reload()
    }

    fn package(&self, id: &str) -> PalResult<Option<PackageRecord>> {
        if self.cached() == 0 {
            self.reload()?;
        }
        Ok(self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    fn clean_up(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftwareFacts {
    pub product_id: String,
    pub display_name: String,
    pub product_version: String,
    pub version_major: Option<u32>,
    pub version_minor: Option<u32>,
    pub publisher: Option<String>,
    pub architecture: Option<String>,
    pub install_source: Option<String>,
    pub installed_size_bytes: Option<u64>,
    /// First line of the package description.
    pub summary: Option<String>,
}

impl SoftwareFacts {
    /// Builds facts from a dpkg record. The `Version` field is required.
    pub fn from_record(id: &str, record: &PackageRecord) -> PalResult<Self> {
        let version = record.get("Version").ok_or_else(|| ErrorKind::MissingField {
            field: "Version".to_string(),
            location: format!("dpkg record '{}'", id),
        })?;
        let (version_major, version_minor) = version_numbers(version);
        let owned = |field: &str| record.get(field).map(str::to_string);

        Ok(Self {
            product_id: id.to_string(),
            display_name: id.to_string(),
            product_version: version.to_string(),
            version_major,
            version_minor,
            publisher: owned("Maintainer"),
            architecture: owned("Architecture"),
            install_source: owned("Source"),
            installed_size_bytes: record
                .get("Installed-Size")
                .and_then(|s| s.parse::<u64>().ok())
                .and_then(|kib| kib.checked_mul(1024)),
            summary: record
                .get("Description")
                .and_then(|d| d.lines().next())
                .map(str::to_string),
        })
    }
}

pub struct InstalledSoftwareInstance {
    state: InstanceState,
    deps: Arc<dyn SoftwareDependencies>,
    facts: SoftwareFacts,
}

impl InstalledSoftwareInstance {
    /// Loads the package record; fails if it cannot be read or is incomplete.
    pub fn new(id: &str, deps: Arc<dyn SoftwareDependencies>) -> PalResult<Self> {
        let mut instance = Self {
            state: InstanceState::new(id),
            deps,
            facts: SoftwareFacts::default(),
        };
        instance.update()?;
        Ok(instance)
    }
}

impl EntityInstance for InstalledSoftwareInstance {
    type Facts = SoftwareFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &SoftwareFacts {
        &self.facts
    }

    fn update(&mut self) -> PalResult<()> {
        let id = self.state.id();
        let record = self.deps.package(id)?.ok_or_else(|| ErrorKind::PathNotFound {
            path: format!("dpkg package '{}'", id),
        })?;
        self.facts = SoftwareFacts::from_record(id, &record)?;
        Ok(())
    }
}

/// A package uninstalled between discovery and update is expected.
fn uninstalled_packages_expected(_id: &str, err: &PalError) -> FailureClass {
    match err.kind() {
        ErrorKind::PathNotFound { .. } => FailureClass::Expected,
        _ => FailureClass::Unexpected,
    }
}

/// One instance per installed package, keyed by package name.
pub struct InstalledSoftwareProvider {
    deps: Arc<dyn SoftwareDependencies>,
}

impl InstalledSoftwareProvider {
    pub fn new(deps: Arc<dyn SoftwareDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for InstalledSoftwareProvider {
    type Instance = InstalledSoftwareInstance;
    type Observation = ();
    const NAME: &'static str = "installed_software";

    fn discover(&mut self) -> PalResult<Option<Vec<Observed<()>>>> {
        Ok(Some(
            self.deps
                .installed_ids()?
                .into_iter()
                .map(|id| Observed::new(id, ()))
                .collect(),
        ))
    }

    fn create(&mut self, observed: Observed<()>) -> PalResult<Option<InstalledSoftwareInstance>> {
        InstalledSoftwareInstance::new(&observed.id, self.deps.clone()).map(Some)
    }

    fn failure_policy(&self) -> Box<dyn FailurePolicy> {
        Box::new(uninstalled_packages_expected)
    }

    fn clean_up(&mut self) {
        self.deps.clean_up();
    }
}

pub type InstalledSoftwareEnumeration = Enumeration<InstalledSoftwareProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-installed-software"))]
crate::register_enumeration!("installed_software", |ctx| {
    let deps = DpkgStatusDependencies::new(
        HostFs::new(&ctx.config.host_root),
        ctx.config.installed_software.status_file.clone(),
    );
    Box::new(InstalledSoftwareEnumeration::new(
        InstalledSoftwareProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
