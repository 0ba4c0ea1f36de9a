//! Configuration structures for the platform enumerations.
//!
//! These types select which enumerations the agent runs, how often they are
//! updated and published, and the per-enumeration options handed to the Linux
//! dependency objects.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Enumeration names in the order they are reported by default.
pub const KNOWN_ENUMERATIONS: &[&str] = &[
    "bios",
    "computer_system",
    "cpu_properties",
    "installed_software",
    "logical_disk",
    "memory",
    "net_route",
    "network_interface",
    "os",
    "physical_disk",
];

/// Options for the network interface enumeration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkInterfaceConfig {
    /// Also report interfaces that are neither up nor running.
    pub include_non_running: bool,
}

/// Options for the static logical disk enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LogicalDiskConfig {
    /// Filesystem types that are never reported (pseudo and virtual filesystems).
    pub ignored_filesystems: Vec<String>,

    /// Mount sources that are never reported.
    pub ignored_devices: Vec<String>,
}

impl Default for LogicalDiskConfig {
    fn default() -> Self {
        let ignored_filesystems = [
            "autofs",
            "binfmt_misc",
            "bpf",
            "cgroup",
            "cgroup2",
            "configfs",
            "debugfs",
            "devpts",
            "devtmpfs",
            "efivarfs",
            "fusectl",
            "hugetlbfs",
            "mqueue",
            "nsfs",
            "overlay",
            "proc",
            "pstore",
            "ramfs",
            "rpc_pipefs",
            "securityfs",
            "squashfs",
            "sysfs",
            "tmpfs",
            "tracefs",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            ignored_filesystems,
            ignored_devices: vec!["none".into(), "rootfs".into()],
        }
    }
}

/// Options for the route table enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetRouteConfig {
    /// Route table file, relative to `host_root`.
    #[validate(length(min = 1, message = "Route file must not be empty"))]
    pub route_file: String,
}

impl Default for NetRouteConfig {
    fn default() -> Self {
        Self {
            route_file: "/proc/net/route".into(),
        }
    }
}

/// Options for the installed software enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct InstalledSoftwareConfig {
    /// dpkg status database, relative to `host_root`.
    #[validate(length(min = 1, message = "Status file must not be empty"))]
    pub status_file: String,
}

impl Default for InstalledSoftwareConfig {
    fn default() -> Self {
        Self {
            status_file: "/var/lib/dpkg/status".into(),
        }
    }
}

/// Top-level enumeration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EnumerationsConfig {
    /// Enumerations that are initialised and updated periodically.
    #[validate(length(
        min = 1,
        message = "At least one enumeration must be enabled, possible values: bios, computer_system, cpu_properties, installed_software, logical_disk, memory, net_route, network_interface, os, physical_disk"
    ))]
    pub enabled: Vec<String>,

    /// Interval (in seconds) between update and publish passes.
    #[validate(range(min = 1, message = "Collection interval must be at least 1 second"))]
    pub collection_interval: u64,

    /// Directory under which `/proc`, `/sys`, `/etc` and `/var` are read.
    #[validate(length(min = 1, message = "Host root must not be empty"))]
    pub host_root: String,

    #[validate(nested)]
    pub network_interface: NetworkInterfaceConfig,

    #[validate(nested)]
    pub logical_disk: LogicalDiskConfig,

    #[validate(nested)]
    pub net_route: NetRouteConfig,

    #[validate(nested)]
    pub installed_software: InstalledSoftwareConfig,
}

impl Default for EnumerationsConfig {
    fn default() -> Self {
        Self {
            enabled: ["memory", "os", "cpu_properties", "network_interface", "logical_disk"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            collection_interval: 30,
            host_root: "/".into(),
            network_interface: NetworkInterfaceConfig::default(),
            logical_disk: LogicalDiskConfig::default(),
            net_route: NetRouteConfig::default(),
            installed_software: InstalledSoftwareConfig::default(),
        }
    }
}

impl EnumerationsConfig {
    /// Return enabled enumeration names
    pub fn enabled_names(&self) -> Vec<&str> {
        self.enabled.iter().map(String::as_str).collect()
    }
}
