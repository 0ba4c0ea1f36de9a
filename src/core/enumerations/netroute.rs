use std::{net::Ipv4Addr, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{
    enumeration::Enumeration,
    error::ErrorKind,
    hostfs::HostFs,
    instance::{EntityInstance, InstanceState},
    traits::{EntityProvider, Observed},
    types::PalResult,
};

/// Columns of a `/proc/net/route` line.
pub const ROUTE_FIELDS: usize = 11;

static INTERFACE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^eth[0-9][0-9]?$").unwrap());

/// Accepts `lo` and `eth<N>`/`eth<NN>` as interfaces of a requested route.
///
/// Only [`RouteRequest`] applies this; routes read from the kernel table are
/// taken as they are.
pub fn validate_interface(iface: &str) -> bool {
    iface == "lo" || INTERFACE_NAME.is_match(iface)
}

/// Checks an optional numeric parameter of a requested route.
///
/// An empty value becomes `"0"`; anything else must be all ASCII digits.
pub fn normalize_numeric_parameter(param: &str) -> Option<String> {
    if param.is_empty() {
        return Some("0".to_string());
    }
    param
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| param.to_string())
}

/// Converts the kernel's little-endian hex address into an IPv4 address.
pub fn hex_to_ipv4(hex: &str) -> PalResult<Ipv4Addr> {
    let value = u32::from_str_radix(hex, 16).map_err(|e| ErrorKind::InvalidFormat {
        location: "route address".to_string(),
        reason: format!("'{}': {}", hex, e),
    })?;
    Ok(Ipv4Addr::from(value.to_le_bytes()))
}

fn ipv4_to_hex(addr: Ipv4Addr) -> String {
    format!("{:08X}", u32::from_le_bytes(addr.octets()))
}

/// A route entry supplied by a caller, e.g. from a management request.
///
/// Addresses are dotted IPv4; the optional numeric fields may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouteRequest {
    pub interface: String,
    pub destination: String,
    pub gateway: String,
    pub mask: String,
    pub metric: String,
    pub mtu: String,
    pub window: String,
    pub irtt: String,
}

impl RouteRequest {
    /// Validates the request and builds the route it describes.
    pub fn into_facts(self) -> PalResult<RouteFacts> {
        if !validate_interface(&self.interface) {
            return Err(ErrorKind::InvalidFormat {
                location: "route request".to_string(),
                reason: format!("unsupported interface '{}'", self.interface),
            }
            .into());
        }

        let address = |name: &str, value: &str| -> PalResult<Ipv4Addr> {
            value.parse().map_err(|e: std::net::AddrParseError| {
                ErrorKind::ParseError {
                    metric: name.to_string(),
                    location: "route request".to_string(),
                    reason: format!("'{}': {}", value, e),
                }
                .into()
            })
        };
        let number = |name: &str, value: &str| -> PalResult<u32> {
            let invalid = |reason: String| ErrorKind::ParseError {
                metric: name.to_string(),
                location: "route request".to_string(),
                reason,
            };
            let digits = normalize_numeric_parameter(value)
                .ok_or_else(|| invalid(format!("'{}' is not a number", value)))?;
            digits
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(format!("'{}': {}", value, e)).into())
        };

        let gateway = if self.gateway.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            address("gateway", &self.gateway)?
        };
        // RTF_UP, plus RTF_GATEWAY when routed through a gateway.
        let flags = if gateway.is_unspecified() { 0x1 } else { 0x3 };

        Ok(RouteFacts {
            destination: address("destination", &self.destination)?,
            gateway,
            mask: address("mask", &self.mask)?,
            flags,
            refcount: 0,
            use_count: 0,
            metric: number("metric", &self.metric)?,
            mtu: number("mtu", &self.mtu)?,
            window: number("window", &self.window)?,
            irtt: number("irtt", &self.irtt)?,
            interface: self.interface,
        })
    }
}

/// Source of route table lines, header excluded.
pub trait NetRouteDependencies: Send + Sync {
    fn lines(&self) -> PalResult<Vec<String>>;
}

/// Reads a `/proc/net/route` formatted file.
#[derive(Debug, Clone)]
pub struct RouteFileDependencies {
    fs: HostFs,
    route_file: String,
}

impl RouteFileDependencies {
    pub fn new(fs: HostFs, route_file: impl Into<String>) -> Self {
        Self {
            fs,
            route_file: route_file.into(),
        }
    }
}

impl NetRouteDependencies for RouteFileDependencies {
    fn lines(&self) -> PalResult<Vec<String>> {
        let content = self.fs.read_to_string(&self.route_file)?;
        Ok(content
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFacts {
    pub interface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// `RTF_*` bits, reported in hex by the kernel.
    pub flags: u16,
    pub refcount: u32,
    #[serde(rename = "use")]
    pub use_count: u32,
    pub metric: u32,
    pub mtu: u32,
    pub window: u32,
    pub irtt: u32,
}

impl RouteFacts {
    /// Parses one route line.
    pub fn parse(line: &str) -> PalResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != ROUTE_FIELDS {
            return Err(ErrorKind::InvalidFormat {
                location: "route table".to_string(),
                reason: format!("expected {} fields, got {}", ROUTE_FIELDS, fields.len()),
            }
            .into());
        }

        let number = |index: usize, name: &str| -> PalResult<u32> {
            fields[index].parse().map_err(|e: std::num::ParseIntError| {
                ErrorKind::ParseError {
                    metric: name.to_string(),
                    location: "route table".to_string(),
                    reason: format!("'{}': {}", fields[index], e),
                }
                .into()
            })
        };
        let flags = u16::from_str_radix(fields[3], 16).map_err(|e| ErrorKind::ParseError {
            metric: "flags".to_string(),
            location: "route table".to_string(),
            reason: format!("'{}': {}", fields[3], e),
        })?;

        Ok(Self {
            interface: fields[0].to_string(),
            destination: hex_to_ipv4(fields[1])?,
            gateway: hex_to_ipv4(fields[2])?,
            flags,
            refcount: number(4, "refcount")?,
            use_count: number(5, "use")?,
            metric: number(6, "metric")?,
            mask: hex_to_ipv4(fields[7])?,
            mtu: number(8, "mtu")?,
            window: number(9, "window")?,
            irtt: number(10, "irtt")?,
        })
    }

    /// Renders the route as a tab separated route table line.
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{:04X}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.interface,
            ipv4_to_hex(self.destination),
            ipv4_to_hex(self.gateway),
            self.flags,
            self.refcount,
            self.use_count,
            self.metric,
            ipv4_to_hex(self.mask),
            self.mtu,
            self.window,
            self.irtt
        )
    }

    /// Routes are identified by interface, destination, mask and metric.
    pub fn id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.interface, self.destination, self.mask, self.metric
        )
    }
}

pub struct NetRouteInstance {
    state: InstanceState,
    facts: RouteFacts,
}

impl EntityInstance for NetRouteInstance {
    type Facts = RouteFacts;

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn facts(&self) -> &RouteFacts {
        &self.facts
    }
}

/// One instance per route table entry.
pub struct NetRouteProvider {
    deps: Arc<dyn NetRouteDependencies>,
}

impl NetRouteProvider {
    pub fn new(deps: Arc<dyn NetRouteDependencies>) -> Self {
        Self { deps }
    }
}

impl EntityProvider for NetRouteProvider {
    type Instance = NetRouteInstance;
    type Observation = RouteFacts;
    const NAME: &'static str = "net_route";

    /// A malformed line rejects the whole table.
    fn discover(&mut self) -> PalResult<Option<Vec<Observed<RouteFacts>>>> {
        let routes = self
            .deps
            .lines()?
            .iter()
            .map(|line| RouteFacts::parse(line))
            .collect::<PalResult<Vec<_>>>()?;
        Ok(Some(
            routes
                .into_iter()
                .map(|route| Observed::new(route.id(), route))
                .collect(),
        ))
    }

    fn create(&mut self, observed: Observed<RouteFacts>) -> PalResult<Option<NetRouteInstance>> {
        Ok(Some(NetRouteInstance {
            state: InstanceState::new(observed.id),
            facts: observed.observation,
        }))
    }

    fn refresh(&mut self, instance: &mut NetRouteInstance, route: RouteFacts) {
        instance.facts = route;
    }
}

pub type NetRouteEnumeration = Enumeration<NetRouteProvider>;

#[cfg(all(target_os = "linux", feature = "enumeration-net-route"))]
crate::register_enumeration!("net_route", |ctx| {
    let deps = RouteFileDependencies::new(
        HostFs::new(&ctx.config.host_root),
        ctx.config.net_route.route_file.clone(),
    );
    Box::new(NetRouteEnumeration::new(
        NetRouteProvider::new(Arc::new(deps)),
        &ctx.logs,
    ))
});
