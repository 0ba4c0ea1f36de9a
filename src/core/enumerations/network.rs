use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::{EntityProvider, Observed},
    types::PalResult,
};

/// `IFF_UP` in `/sys/class/net/<if>/flags`.
const IFF_UP: u32 = 0x1;
/// `IFF_LOOPBACK`.
const IFF_LOOPBACK: u32 = 0x8;
/// `IFF_RUNNING`.
const IFF_RUNNING: u32 = 0x40;

/// Cumulative traffic counters from `/proc/net/dev`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub receive_bytes: u64,
    pub receive_packets: u64,
    pub receive_errors: u64,
    pub receive_drops: u64,
    pub transmit_bytes: u64,
    pub transmit_packets: u64,
    pub transmit_errors: u64,
    pub transmit_drops: u64,
    pub collisions: u64,
}

/// Everything known about one interface at discovery time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceFacts {
    /// Interface name (e.g. "eth0", "wlan0", "docker0").
    pub name: String,
    pub mac_address: Option<String>,
    pub mtu: Option<u32>,
    /// Link speed, absent for virtual interfaces.
    pub speed_mbps: Option<u32>,
    /// Kernel operational state ("up", "down", "unknown").
    pub operstate: Option<String>,
    /// `None` when the interface flags could not be read.
    pub up: Option<bool>,
    pub running: Option<bool>,
    pub loopback: bool,
    pub counters: InterfaceCounters,
}

/// Network interface data source.
pub trait NetworkDependencies: Send + Sync {
    /// Every interface currently known to the kernel.
    fn interfaces(&self) -> PalResult<Vec<InterfaceFacts>>;
}

/// Parses the counter lines of `/proc/net/dev`.
///
/// Format: `iface: rx_bytes rx_packets rx_errs rx_drop rx_fifo rx_frame
/// rx_compressed rx_multicast tx_bytes tx_packets tx_errs tx_drop tx_fifo
/// tx_colls tx_carrier tx_compressed`.
pub fn parse_net_dev(content: &str) -> PalResult<Vec<(String, InterfaceCounters)>> {
    let mut interfaces = Vec::with_capacity(16);
    // First two lines are column headers.
    for line in content.lines().skip(2) {
        let Some((name, values)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let values: Vec<u64> = values
            .split_whitespace()
            .map(str::parse::<u64>)
            .collect::<Result<_, _>>()
            .map_err(|e| ErrorKind::ParseError {
                metric: "interface_counters".to_string(),
                location: format!("/proc/net/dev interface={}", name),
                reason: e.to_string(),
            })?;
        if values.len() < 16 {
            continue;
        }
        interfaces.push((
            name.to_string(),
            InterfaceCounters {
                receive_bytes: values[0],
                receive_packets: values[1],
                receive_errors: values[2],
                receive_drops: values[3],
                transmit_bytes: values[8],
                transmit_packets: values[9],
                transmit_errors: values[10],
                transmit_drops: values[11],
                collisions: values[13],
            },
        ));
    }
    Ok(interfaces)
}

/// Parses the hexadecimal `flags` attribute (`0x1003`).
pub fn parse_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    u32::from_str_radix(raw.strip_prefix("0x").unwrap_or(raw), 16).ok()
}

/// Combines `/proc/net/dev` with `/sys/class/net/<if>` attributes.
#[derive(Debug, Clone, Default)]
pub struct LinuxNetworkDependencies {
    fs: HostFs,
}

impl LinuxNetworkDependencies {
    pub fn new(fs: HostFs) -> Self {
        Self { fs }
    }
}

impl NetworkDependencies for LinuxNetworkDependencies {
    fn interfaces(&self) -> PalResult<Vec<InterfaceFacts>> {
        let content = self.fs.read_to_string("/proc/net/dev")?;
        let interfaces = parse_net_dev(&content)?;

        Ok(interfaces
            .into_iter()
            .map(|(name, counters)| {
                let attr = |attribute: &str| {
                    self.fs
                        .read_attribute(&format!("/sys/class/net/{}/{}", name, attribute))
                };
                let flags = attr("flags").and_then(|f| parse_flags(&f));
                InterfaceFacts {
                    mac_address: attr("address"),
                    mtu: attr("mtu").and_then(|v| v.parse().ok()),
                    speed_mbps: attr("speed").and_then(|v| v.parse().ok()),
                    operstate: attr("operstate"),
                    up: flags.map(|f| f & IFF_UP != 0),
                    running: flags.map(|f| f & IFF_RUNNING != 0),
                    loopback: flags.is_some_and(|f| f & IFF_LOOPBACK != 0) || name == "lo",
                    counters,
                    name,
                }
            })
            .collect())
    }
}

pub struct NetworkInterfaceInstance {
    state: InstanceState,
    facts: InterfaceFacts,
}

impl EntityInstance for NetworkInterfaceInstance {
    type Facts = InterfaceFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &InterfaceFacts {
        &self.facts
    }
}

/// One instance per non-loopback interface, keyed by name.
///
/// New interfaces are only added when their state is known and, unless
/// `include_non_running` is set, they are up or running. Interfaces already
/// tracked stay until they disappear from the kernel.
pub struct NetworkInterfaceProvider {
    deps: Arc<dyn NetworkDependencies>,
    include_non_running: bool,
}

impl NetworkInterfaceProvider {
    pub fn new(deps: Arc<dyn NetworkDependencies>, include_non_running: bool) -> Self {
        Self {
            deps,
            include_non_running,
        }
    }

    fn accepts(&self, facts: &InterfaceFacts) -> bool {
        if facts.loopback {
            return false;
        }
        match (facts.up, facts.running) {
            (Some(up), Some(running)) => self.include_non_running || up || running,
            _ => false,
        }
    }
}

impl EntityProvider for NetworkInterfaceProvider {
    type Instance = NetworkInterfaceInstance;
    type Observation = InterfaceFacts;
    const NAME: &'static str = "network_interface";

    fn discover(&mut self) -> PalResult<Option<Vec<Observed<InterfaceFacts>>>> {
        Ok(Some(
            self.deps
                .interfaces()?
                .into_iter()
                .map(|facts| Observed::new(facts.name.clone(), facts))
                .collect(),
        ))
    }

    fn create(
        &mut self,
        observed: Observed<InterfaceFacts>,
    ) -> PalResult<Option<NetworkInterfaceInstance>> {
        if !self.accepts(&observed.observation) {
            return Ok(None);
        }
        Ok(Some(NetworkInterfaceInstance {
            state: InstanceState::new(observed.id),
            facts: observed.observation,
        }))
    }

    fn refresh(&mut self, instance: &mut NetworkInterfaceInstance, facts: InterfaceFacts) {
        instance.facts = facts;
    }
}

pub type NetworkInterfaceEnumeration = Enumeration<NetworkInterfaceProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-network-interface"))]
crate::register_enumeration!("network_interface", |ctx| {
    let deps = LinuxNetworkDependencies::new(HostFs::new(&ctx.config.host_root));
    Box::new(NetworkInterfaceEnumeration::new(
        NetworkInterfaceProvider::new(
            Arc::new(deps),
            ctx.config.network_interface.include_non_running,
        ),
        &ctx.logs,
    ))
});

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::core::{enumerations::hostfs::testing::write, log::LogRegistry};

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     789    0    0    0     0          0         0   123456     789    0    0    0     0       0          0
  eth0: 9876543   12345    1    2    0     0          0        10  1234567    6789    3    4    0     5       0          0
  eth1:       0       0    0    0    0     0          0         0        0       0    0    0    0     0       0          0
";

    fn host() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "/proc/net/dev", NET_DEV);
        write(dir.path(), "/sys/class/net/lo/flags", "0x9\n");
        write(dir.path(), "/sys/class/net/eth0/flags", "0x1043\n");
        write(dir.path(), "/sys/class/net/eth0/address", "52:54:00:12:34:56\n");
        write(dir.path(), "/sys/class/net/eth0/mtu", "1500\n");
        write(dir.path(), "/sys/class/net/eth0/speed", "1000\n");
        write(dir.path(), "/sys/class/net/eth0/operstate", "up\n");
        write(dir.path(), "/sys/class/net/eth1/flags", "0x1002\n");
        write(dir.path(), "/sys/class/net/eth1/speed", "-1\n");
        dir
    }

    fn enumeration(dir: &TempDir, include_non_running: bool) -> NetworkInterfaceEnumeration {
        let deps = Arc::new(LinuxNetworkDependencies::new(HostFs::new(dir.path())));
        NetworkInterfaceEnumeration::new(
            NetworkInterfaceProvider::new(deps, include_non_running),
            &LogRegistry::new(),
        )
    }

    #[test]
    fn net_dev_counters_are_mapped_by_column() {
        let parsed = parse_net_dev(NET_DEV).unwrap();
        assert_eq!(parsed.len(), 3);
        let (name, counters) = &parsed[1];
        assert_eq!(name, "eth0");
        assert_eq!(counters.receive_bytes, 9_876_543);
        assert_eq!(counters.receive_drops, 2);
        assert_eq!(counters.transmit_bytes, 1_234_567);
        assert_eq!(counters.transmit_drops, 4);
        assert_eq!(counters.collisions, 5);
    }

    #[test]
    fn garbage_counters_are_a_parse_error() {
        let err = parse_net_dev("h\nh\neth0: 1 2 x\n").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ParseError { location, .. } if location.contains("eth0")));
    }

    #[test]
    fn flags_parse_with_and_without_prefix() {
        assert_eq!(parse_flags("0x1003"), Some(0x1003));
        assert_eq!(parse_flags("1003\n"), Some(0x1003));
        assert_eq!(parse_flags("zz"), None);
    }

    #[test]
    fn loopback_and_down_interfaces_are_skipped() {
        let dir = host();
        let mut interfaces = enumeration(&dir, false);
        interfaces.init().unwrap();

        assert_eq!(interfaces.instance_ids().collect::<Vec<_>>(), vec!["eth0"]);
        let eth0 = interfaces.get_by_id("eth0").unwrap().facts();
        assert_eq!(eth0.mac_address.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(eth0.mtu, Some(1500));
        assert_eq!(eth0.speed_mbps, Some(1000));
        assert_eq!(eth0.up, Some(true));
        assert_eq!(eth0.running, Some(true));
    }

    #[test]
    fn include_non_running_adds_down_interfaces() {
        let dir = host();
        let mut interfaces = enumeration(&dir, true);
        interfaces.init().unwrap();

        assert_eq!(
            interfaces.instance_ids().collect::<Vec<_>>(),
            vec!["eth0", "eth1"]
        );
        assert_eq!(interfaces.get_by_id("eth1").unwrap().facts().speed_mbps, None);
    }

    #[test]
    fn tracked_interface_going_down_is_kept_and_refreshed() {
        let dir = host();
        let mut interfaces = enumeration(&dir, false);
        interfaces.init().unwrap();

        write(dir.path(), "/sys/class/net/eth0/flags", "0x1002\n");
        write(dir.path(), "/sys/class/net/eth0/operstate", "down\n");
        interfaces.update(true).unwrap();

        let eth0 = interfaces.get_by_id("eth0").unwrap().facts();
        assert_eq!(eth0.up, Some(false));
        assert_eq!(eth0.operstate.as_deref(), Some("down"));
    }

    #[test]
    fn vanished_interface_is_removed() {
        let dir = host();
        let mut interfaces = enumeration(&dir, true);
        interfaces.init().unwrap();

        let without_eth1: String = NET_DEV
            .lines()
            .filter(|l| !l.contains("eth1"))
            .map(|l| format!("{}\n", l))
            .collect();
        write(dir.path(), "/proc/net/dev", &without_eth1);

        let report = interfaces.update(true).unwrap();
        assert_eq!(report.removed, vec!["eth1".to_string()]);
        assert_eq!(interfaces.len(), 1);
    }

    #[test]
    fn missing_net_dev_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut interfaces = enumeration(&dir, false);
        assert!(interfaces.init().is_err());
    }
}
