use std::sync::Arc;

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
use crate::config::enumerations::LogicalDiskConfig;

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Mount source (e.g. "/dev/sda1", "server:/export").
    pub device: String,
    /// Mount point (e.g. "/", "/home").
    pub mount_point: String,
    /// Filesystem type (e.g. "ext4", "xfs", "btrfs").
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Space and inode usage as reported by `statvfs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Space available to unprivileged users.
    pub available_bytes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
    pub available_inodes: u64,
}

/// Mount table and usage source.
pub trait LogicalDiskDependencies: Send + Sync {
    fn mounts(&self) -> PalResult<Vec<MountEntry>>;

    fn usage(&self, mount_point: &str) -> PalResult<FilesystemUsage>;
}

/// Decodes the octal escapes (`\040` for space) used in `/proc/mounts`.
pub fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses `/proc/mounts` lines: `device mount_point fs_type options dump pass`.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields
                .next()
                .map(|o| o.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: unescape_mount_field(mount_point),
                fs_type: fs_type.to_string(),
                options,
            })
        })
        .collect()
}

/// Reads `/proc/mounts` and queries usage with `statvfs`.
#[derive(Debug, Clone, Default)]
pub struct LinuxLogicalDiskDependencies {
    fs: HostFs,
}

impl LinuxLogicalDiskDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl LogicalDiskDependencies for LinuxLogicalDiskDependencies {
    fn mounts(&self) -> PalResult<Vec<MountEntry>> {
        let content = self.fs.read_to_string("/proc/mounts")?;
        Ok(parse_mounts(&content))
    }

    fn usage(&self, mount_point: &str) -> PalResult<FilesystemUsage> {
        statvfs_usage(&self.fs.path(mount_point))
    }
}

#[cfg(unix)]
fn statvfs_usage(path: &std::path::Path) -> PalResult<FilesystemUsage> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| ErrorKind::InvalidFormat {
        location: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return Err(ErrorKind::SystemCall {
            syscall: format!("statvfs({})", path.display()),
            reason: err.to_string(),
        }
        .into());
    }

    let block_size = stat.f_frsize as u64;
    let total_bytes = (stat.f_blocks as u64).saturating_mul(block_size);
    let free_bytes = (stat.f_bfree as u64).saturating_mul(block_size);
    let total_inodes = stat.f_files as u64;
    let free_inodes = stat.f_ffree as u64;
    Ok(FilesystemUsage {
        total_bytes,
        used_bytes: total_bytes.saturating_sub(free_bytes),
        available_bytes: (stat.f_bavail as u64).saturating_mul(block_size),
        total_inodes,
        used_inodes: total_inodes.saturating_sub(free_inodes),
        available_inodes: stat.f_favail as u64,
    })
}

#[cfg(not(unix))]
fn statvfs_usage(path: &std::path::Path) -> PalResult<FilesystemUsage> {
    Err(ErrorKind::Unsupported(format!("statvfs({})", path.display())).into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalDiskFacts {
    pub device: String,
    pub mount_point: String,
    pub file_system: String,
    pub read_only: bool,
    /// `None` until the first successful update.
    pub usage: Option<FilesystemUsage>,
}

pub struct LogicalDiskInstance {
    state: InstanceState,
    deps: Arc<dyn LogicalDiskDependencies>,
    facts: LogicalDiskFacts,
}

impl LogicalDiskInstance {
    fn new(deps: Arc<dyn LogicalDiskDependencies>, mount: MountEntry) -> Self {
        Self {
            state: InstanceState::new(mount.mount_point.clone()),
            deps,
            facts: LogicalDiskFacts {
                read_only: mount.is_read_only(),
                device: mount.device,
                mount_point: mount.mount_point,
                file_system: mount.fs_type,
                usage: None,
            },
        }
    }

    fn apply_mount(&mut self, mount: MountEntry) {
        self.facts.read_only = mount.is_read_only();
        self.facts.device = mount.device;
        self.facts.file_system = mount.fs_type;
    }
}

impl EntityInstance for LogicalDiskInstance {
    type Facts = LogicalDiskFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &LogicalDiskFacts {
        &self.facts
    }

    fn update(&mut self) -> PalResult<()> {
        self.facts.usage = Some(self.deps.usage(&self.facts.mount_point)?);
        Ok(())
    }
}

/// One instance per mounted filesystem, keyed by mount point.
pub struct LogicalDiskProvider {
    deps: Arc<dyn LogicalDiskDependencies>,
    config: LogicalDiskConfig,
}

impl LogicalDiskProvider {
    pub fn new(deps: Arc<dyn LogicalDiskDependencies>, config: LogicalDiskConfig) -> Self {
        Self { deps, config }
    }

    fn is_ignored(&self, mount: &MountEntry) -> bool {
        self.config
            .ignored_filesystems
            .iter()
            .any(|fs| *fs == mount.fs_type)
            || mount.fs_type.starts_with("fuse.")
            || self.config.ignored_devices.iter().any(|d| *d == mount.device)
    }
}

impl EntityProvider for LogicalDiskProvider {
    type Instance = LogicalDiskInstance;
    type Observation = MountEntry;
    const NAME: &'static str = "logical_disk";

    fn discover(&mut self) -> PalResult<Option<Vec<Observed<MountEntry>>>> {
        // A later entry for the same mount point shadows earlier ones.
        let mut effective: IndexMap<String, MountEntry> = IndexMap::new();
        for mount in self.deps.mounts()? {
            if self.is_ignored(&mount) {
                continue;
            }
            effective.insert(mount.mount_point.clone(), mount);
        }
        Ok(Some(
            effective
                .into_iter()
                .map(|(mount_point, mount)| Observed::new(mount_point, mount))
                .collect(),
        ))
    }

    fn create(&mut self, observed: Observed<MountEntry>) -> PalResult<Option<LogicalDiskInstance>> {
        Ok(Some(LogicalDiskInstance::new(
            self.deps.clone(),
            observed.observation,
        )))
    }

    fn refresh(&mut self, instance: &mut LogicalDiskInstance, mount: MountEntry) {
        instance.apply_mount(mount);
    }
}

pub type LogicalDiskEnumeration = Enumeration<LogicalDiskProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-logical-disk"))]
crate::register_enumeration!("logical_disk", |ctx| {
    let deps = LinuxLogicalDiskDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(LogicalDiskEnumeration::new(
        LogicalDiskProvider::new(Arc::new(deps), ctx.config.logical_disk.clone()),
        &ctx.logs,
    ))
});

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    use tempfile::TempDir;

    use super::*;
    use crate::core::{enumerations::hostfs::testing::write, log::LogRegistry};

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev 0 0
/dev/sdb1 /mnt/backup\\040disk xfs ro,relatime 0 0
gvfsd-fuse /run/user/1000/gvfs fuse.gvfsd-fuse rw 0 0
";

    struct FakeDisks {
        mounts: Mutex<String>,
        usage: Mutex<HashMap<String, FilesystemUsage>>,
    }

    impl LogicalDiskDependencies for FakeDisks {
        fn mounts(&self) -> PalResult<Vec<MountEntry>> {
            Ok(parse_mounts(&self.mounts.lock().unwrap()))
        }

        fn usage(&self, mount_point: &str) -> PalResult<FilesystemUsage> {
            self.usage
                .lock()
                .unwrap()
                .get(mount_point)
                .cloned()
                .ok_or_else(|| {
                    ErrorKind::SystemCall {
                        syscall: format!("statvfs({})", mount_point),
                        reason: "No such file or directory".into(),
                    }
                    .into()
                })
        }
    }

    fn fake() -> Arc<FakeDisks> {
        let usage = FilesystemUsage {
            total_bytes: 100,
            used_bytes: 40,
            available_bytes: 55,
            ..Default::default()
        };
        Arc::new(FakeDisks {
            mounts: Mutex::new(MOUNTS.to_string()),
            usage: Mutex::new(HashMap::from([("/".to_string(), usage)])),
        })
    }

    #[test]
    fn octal_escapes_are_decoded() {
        assert_eq!(unescape_mount_field("/mnt/backup\\040disk"), "/mnt/backup disk");
        assert_eq!(unescape_mount_field("/plain"), "/plain");
        assert_eq!(unescape_mount_field("trailing\\"), "trailing\\");
    }

    #[test]
    fn mounts_parse_with_options() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.len(), 6);
        assert_eq!(mounts[4].mount_point, "/mnt/backup disk");
        assert!(mounts[4].is_read_only());
        assert!(!mounts[2].is_read_only());
    }

    #[test]
    fn pseudo_filesystems_are_ignored() {
        let mut disks =
            LogicalDiskEnumeration::new(LogicalDiskProvider::new(fake(), LogicalDiskConfig::default()), &LogRegistry::new());
        disks.init().unwrap();
        assert_eq!(
            disks.instance_ids().collect::<Vec<_>>(),
            vec!["/", "/mnt/backup disk"]
        );
    }

    #[test]
    fn usage_failure_is_isolated_per_mount() {
        let mut disks =
            LogicalDiskEnumeration::new(LogicalDiskProvider::new(fake(), LogicalDiskConfig::default()), &LogRegistry::new());
        disks.init().unwrap();
        let report = disks.update(true).unwrap();

        assert_eq!(report.failed, vec!["/mnt/backup disk".to_string()]);
        let root = disks.get_by_id("/").unwrap();
        assert_eq!(root.facts().usage.as_ref().unwrap().used_bytes, 40);
        assert_eq!(root.facts().file_system, "ext4");
        assert!(disks.get_by_id("/mnt/backup disk").unwrap().has_unexpected_error());
    }

    #[test]
    fn unmounted_filesystem_is_removed_and_remount_refreshes() {
        let deps = fake();
        let mut disks = LogicalDiskEnumeration::new(
            LogicalDiskProvider::new(deps.clone(), LogicalDiskConfig::default()),
            &LogRegistry::new(),
        );
        disks.init().unwrap();

        *deps.mounts.lock().unwrap() = "/dev/sda1 / ext4 ro,relatime 0 0\n".to_string();
        let report = disks.update(false).unwrap();
        assert_eq!(report.removed, vec!["/mnt/backup disk".to_string()]);
        assert!(disks.get_by_id("/").unwrap().facts().read_only);
    }

    #[test]
    fn statvfs_reads_real_directory() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "/proc/mounts", "/dev/sda1 / ext4 rw 0 0\n");
        let deps = LinuxLogicalDiskDependencies::new(HostFs::new(dir.path()));

        assert_eq!(deps.mounts().unwrap().len(), 1);
        let usage = deps.usage("/").unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.used_bytes <= usage.total_bytes);
        assert!(deps.usage("/does/not/exist").is_err());
    }
}
