//! Read access to `/proc`, `/sys` and `/etc` below a configurable host root.
//!
//! Every Linux dependency object reads through a `HostFs` so tests can point
//! it at a temporary directory tree, and so the agent can run in a container
//! with the host filesystem mounted elsewhere.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use super::{
    error::{ErrorKind, PalError},
    types::PalResult,
};

#[track_caller]
fn io_error(host_path: &str, source: io::Error) -> PalError {
    let kind = if source.kind() == io::ErrorKind::NotFound {
        ErrorKind::PathNotFound {
            path: host_path.to_string(),
        }
    } else {
        ErrorKind::FileRead {
            path: host_path.to_string(),
            source,
        }
    };
    PalError::new(kind)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFs {
    root: PathBuf,
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute host path such as `/proc/meminfo` below the root.
    pub fn path(&self, host_path: &str) -> PathBuf {
        self.root.join(host_path.trim_start_matches('/'))
    }

    pub fn exists(&self, host_path: &str) -> bool {
        self.path(host_path).exists()
    }

    /// Reads a whole file. A missing file is `PathNotFound`.
    pub fn read_to_string(&self, host_path: &str) -> PalResult<String> {
        fs::read_to_string(self.path(host_path)).map_err(|source| io_error(host_path, source))
    }

    /// Reads a single-value attribute file, trimmed.
    ///
    /// Missing, unreadable or blank attributes yield `None`; sysfs and DMI
    /// attributes are routinely absent or root-only.
    pub fn read_attribute(&self, host_path: &str) -> Option<String> {
        let value = fs::read_to_string(self.path(host_path)).ok()?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Parses a single-value attribute, `None` when absent or malformed.
    pub fn read_parsed<T: std::str::FromStr>(&self, host_path: &str) -> Option<T> {
        self.read_attribute(host_path)?.parse().ok()
    }

    /// Sorted entry names of a directory.
    pub fn read_dir_names(&self, host_path: &str) -> PalResult<Vec<String>> {
        let entries =
            fs::read_dir(self.path(host_path)).map_err(|source| io_error(host_path, source))?;

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }
}


#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{testing::write, *};

    #[test]
    fn paths_are_rooted() {
        let fs = HostFs::new("/host");
        assert_eq!(fs.path("/proc/meminfo"), PathBuf::from("/host/proc/meminfo"));
        assert_eq!(HostFs::default().path("/etc/os-release"), PathBuf::from("/etc/os-release"));
    }

    #[test]
    fn missing_file_is_path_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = HostFs::new(dir.path());
        let err = fs.read_to_string("/proc/meminfo").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PathNotFound { path } if path == "/proc/meminfo"));
    }

    #[test]
    fn attributes_are_trimmed_and_blank_is_none() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "/sys/class/net/eth0/mtu", "1500\n");
        write(dir.path(), "/sys/class/dmi/id/bios_vendor", "  \n");
        let fs = HostFs::new(dir.path());

        assert_eq!(fs.read_attribute("/sys/class/net/eth0/mtu").as_deref(), Some("1500"));
        assert_eq!(fs.read_parsed::<u32>("/sys/class/net/eth0/mtu"), Some(1500));
        assert_eq!(fs.read_attribute("/sys/class/dmi/id/bios_vendor"), None);
        assert_eq!(fs.read_attribute("/sys/class/dmi/id/missing"), None);
    }

    #[test]
    fn dir_names_are_sorted() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "/sys/block/sdb/size", "1");
        write(dir.path(), "/sys/block/sda/size", "1");
        let fs = HostFs::new(dir.path());
        assert_eq!(fs.read_dir_names("/sys/block").unwrap(), vec!["sda", "sdb"]);
        assert!(fs.read_dir_names("/sys/nope").is_err());
    }
}
