//! Data structures used throughout the node controller.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! written to the replicated node registry.  They describe the declared
//! shape of a host (its management endpoint, bridges and role) together
//! with the lifecycle state the controller derives for it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NodeError;

/// Name of the primary virtual switch on every host.
pub const INTEGRATION_BRIDGE: &str = "br-int";
/// Name of the secondary virtual switch on gateway hosts.
pub const ROUTER_BRIDGE: &str = "br-router";
/// Name of the overlay tunnel interface on the integration bridge.
pub const DEFAULT_TUNNEL: &str = "vxlan";
/// Patch interface on the integration bridge side.
pub const PATCH_INTG_BRIDGE: &str = "patch-intg";
/// Patch interface on the router bridge side.
pub const PATCH_ROUT_BRIDGE: &str = "patch-rout";

const OPENFLOW_PREFIX: &str = "of:";
const OVSDB_PREFIX: &str = "ovsdb:";

/// Identifier of a device known to the device-management layer.
///
/// Switching bridges use `of:<16 hex digits>`; management endpoints use
/// `ovsdb:<ip>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Device id of the management endpoint reachable at `ip`.
    pub fn ovsdb(ip: Ipv4Addr) -> Self {
        Self(format!("{}{}", OVSDB_PREFIX, ip))
    }

    /// Parses a switching-bridge identifier, rejecting anything that is
    /// not `of:` followed by 16 hex digits.
    pub fn bridge(id: &str) -> Result<Self, String> {
        let dpid = id
            .strip_prefix(OPENFLOW_PREFIX)
            .ok_or_else(|| format!("bridge id {:?} must start with {:?}", id, OPENFLOW_PREFIX))?;
        if dpid.len() != 16 || hex::decode(dpid).is_err() {
            return Err(format!("bridge id {:?} must carry 16 hex digits", id));
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    /// Datapath id programmed into the bridge: the identifier without
    /// its `of:` prefix.
    pub fn datapath_id(&self) -> &str {
        self.0.strip_prefix(OPENFLOW_PREFIX).unwrap_or(&self.0)
    }

    /// Address of the management endpoint this id names, if it names one.
    pub fn ovsdb_ip(&self) -> Option<Ipv4Addr> {
        self.0.strip_prefix(OVSDB_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 48-bit hardware address, written as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address {:?} is too short", s))?;
            if part.len() != 2 {
                return Err(format!("invalid MAC address {:?}", s));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address {:?}", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address {:?} is too long", s));
        }
        Ok(MacAddr(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Role of a host in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Compute,
    Gateway,
}

/// Lifecycle state of a node.
///
/// Only the reconciler writes this field.  Every state except
/// `Incomplete` is computed from device facts; `Incomplete` is also
/// forced when a node loses connectivity or a required interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Init,
    DeviceCreated,
    Complete,
    Incomplete,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Init => "INIT",
            LifecycleState::DeviceCreated => "DEVICE_CREATED",
            LifecycleState::Complete => "COMPLETE",
            LifecycleState::Incomplete => "INCOMPLETE",
        };
        f.write_str(s)
    }
}

/// Transport used to reach gateways from a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkMode {
    Tunnel,
    Vlan,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Tunnel => "tunnel",
            NetworkMode::Vlan => "vlan",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An OpenFlow controller target programmed into a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: String,
}

impl ControllerInfo {
    pub fn tcp(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            protocol: "tcp".into(),
        }
    }
}

/// Attributes that only gateway nodes carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAttrs {
    pub router_bridge: DeviceId,
    pub uplink_port: String,
    pub external_mac: MacAddr,
    /// Controllers for the router bridge.  `None` programs no controller.
    pub router_controllers: Option<Vec<ControllerInfo>>,
}

/// A compute or gateway host.
///
/// Everything but `state` is declared by configuration; `state` is
/// owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub node_type: NodeType,
    pub management_ip: Ipv4Addr,
    pub management_port: u16,
    pub integration_bridge: DeviceId,
    pub gateway: Option<GatewayAttrs>,
    pub data_ip: Option<Ipv4Addr>,
    pub vlan_intf: Option<String>,
    pub state: LifecycleState,
}

impl Node {
    /// Checks the role invariants: a gateway carries its router bridge,
    /// uplink and external MAC; a compute node has a tunnel address or a
    /// VLAN port.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.hostname.is_empty() {
            return Err(NodeError::InvalidNode {
                hostname: self.hostname.clone(),
                reason: "hostname is empty".into(),
            });
        }
        match (self.node_type, &self.gateway) {
            (NodeType::Gateway, None) => Err(NodeError::InvalidNode {
                hostname: self.hostname.clone(),
                reason: "gateway requires router bridge, uplink and external MAC".into(),
            }),
            (NodeType::Gateway, Some(gw)) if gw.uplink_port.is_empty() => {
                Err(NodeError::InvalidNode {
                    hostname: self.hostname.clone(),
                    reason: "gateway uplink interface name is empty".into(),
                })
            }
            (NodeType::Compute, Some(_)) => Err(NodeError::InvalidNode {
                hostname: self.hostname.clone(),
                reason: "compute node carries gateway attributes".into(),
            }),
            (NodeType::Compute, None) if self.data_ip.is_none() && self.vlan_intf.is_none() => {
                Err(NodeError::InvalidNode {
                    hostname: self.hostname.clone(),
                    reason: "compute node needs a tunnel address or a VLAN port".into(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn ovsdb_id(&self) -> DeviceId {
        DeviceId::ovsdb(self.management_ip)
    }

    pub fn is_gateway(&self) -> bool {
        self.node_type == NodeType::Gateway
    }

    pub fn router_bridge(&self) -> Option<&DeviceId> {
        self.gateway.as_ref().map(|gw| &gw.router_bridge)
    }

    pub fn uplink_port(&self) -> Option<&str> {
        self.gateway.as_ref().map(|gw| gw.uplink_port.as_str())
    }

    /// True if `device` is one of this node's switching bridges.
    pub fn owns_bridge(&self, device: &DeviceId) -> bool {
        &self.integration_bridge == device || self.router_bridge() == Some(device)
    }

    /// Transport modes this node can use to reach gateways.
    pub fn network_modes(&self) -> Vec<NetworkMode> {
        let mut modes = Vec::with_capacity(2);
        if self.data_ip.is_some() {
            modes.push(NetworkMode::Tunnel);
        }
        if self.vlan_intf.is_some() {
            modes.push(NetworkMode::Vlan);
        }
        modes
    }

    pub fn supports(&self, mode: NetworkMode) -> bool {
        match mode {
            NetworkMode::Tunnel => self.data_ip.is_some(),
            NetworkMode::Vlan => self.vlan_intf.is_some(),
        }
    }

    /// Interfaces whose presence the lifecycle depends on.
    pub fn system_interfaces(&self) -> Vec<&str> {
        let mut names = vec![DEFAULT_TUNNEL];
        if let Some(vlan) = &self.vlan_intf {
            names.push(vlan.as_str());
        }
        if let Some(gw) = &self.gateway {
            names.push(PATCH_INTG_BRIDGE);
            names.push(PATCH_ROUT_BRIDGE);
            names.push(gw.uplink_port.as_str());
        }
        names
    }

    pub fn is_system_interface(&self, port_name: &str) -> bool {
        self.system_interfaces().contains(&port_name)
    }

    /// True if both nodes declare the same attributes, ignoring state.
    pub fn same_declaration(&self, other: &Node) -> bool {
        self.hostname == other.hostname
            && self.node_type == other.node_type
            && self.management_ip == other.management_ip
            && self.management_port == other.management_port
            && self.integration_bridge == other.integration_bridge
            && self.gateway == other.gateway
            && self.data_ip == other.data_ip
            && self.vlan_intf == other.vlan_intf
    }

    pub fn with_state(&self, state: LifecycleState) -> Node {
        Node {
            state,
            ..self.clone()
        }
    }
}

/// Handle returned when a listener is registered, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Notification broadcast on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub state: LifecycleState,
    pub node: Node,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn compute(hostname: &str, n: u8) -> Node {
        Node {
            hostname: hostname.into(),
            node_type: NodeType::Compute,
            management_ip: Ipv4Addr::new(10, 0, 0, n),
            management_port: 6640,
            integration_bridge: DeviceId::new(format!("of:00000000000000{:02x}", n)),
            gateway: None,
            data_ip: Some(Ipv4Addr::new(192, 168, 0, n)),
            vlan_intf: None,
            state: LifecycleState::Init,
        }
    }

    pub fn gateway(hostname: &str, n: u8) -> Node {
        Node {
            hostname: hostname.into(),
            node_type: NodeType::Gateway,
            management_ip: Ipv4Addr::new(10, 0, 0, n),
            management_port: 6640,
            integration_bridge: DeviceId::new(format!("of:00000000000000{:02x}", n)),
            gateway: Some(GatewayAttrs {
                router_bridge: DeviceId::new(format!("of:00000000000001{:02x}", n)),
                uplink_port: "eth1".into(),
                external_mac: MacAddr([0x02, 0, 0, 0, 0, n]),
                router_controllers: None,
            }),
            data_ip: Some(Ipv4Addr::new(192, 168, 0, n)),
            vlan_intf: None,
            state: LifecycleState::Init,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_mac_round_trip() {
        let mac: MacAddr = "fa:16:3E:00:0a:01".parse().unwrap();
        assert_eq!(mac.0, [0xfa, 0x16, 0x3e, 0x00, 0x0a, 0x01]);
        assert_eq!(mac.to_string(), "fa:16:3e:00:0a:01");
        assert!("fa:16:3e:00:0a".parse::<MacAddr>().is_err());
        assert!("fa:16:3e:00:0a:01:02".parse::<MacAddr>().is_err());
        assert!("zz:16:3e:00:0a:01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_bridge_id_parsing() {
        let id = DeviceId::bridge("of:00000000000000A1").unwrap();
        assert_eq!(id.as_str(), "of:00000000000000a1");
        assert_eq!(id.datapath_id(), "00000000000000a1");
        assert!(DeviceId::bridge("00000000000000a1").is_err());
        assert!(DeviceId::bridge("of:1234").is_err());
    }

    #[test]
    fn test_role_invariants() {
        assert!(compute("c1", 1).validate().is_ok());
        assert!(gateway("g1", 2).validate().is_ok());

        let mut bare = compute("c1", 1);
        bare.data_ip = None;
        assert!(bare.validate().is_err());
        bare.vlan_intf = Some("eth2".into());
        assert!(bare.validate().is_ok());

        let mut gw = gateway("g1", 2);
        gw.gateway = None;
        assert!(gw.validate().is_err());
    }

    #[test]
    fn test_system_interfaces() {
        let c = compute("c1", 1);
        assert_eq!(c.system_interfaces(), vec![DEFAULT_TUNNEL]);
        assert!(!c.is_system_interface("eth1"));

        let g = gateway("g1", 2);
        assert!(g.is_system_interface(PATCH_INTG_BRIDGE));
        assert!(g.is_system_interface(PATCH_ROUT_BRIDGE));
        assert!(g.is_system_interface("eth1"));
        assert!(!g.is_system_interface("tap0"));
    }

    #[test]
    fn test_same_declaration_ignores_state() {
        let c = compute("c1", 1);
        assert!(c.same_declaration(&c.with_state(LifecycleState::Complete)));
        let mut moved = c.clone();
        moved.management_ip = Ipv4Addr::new(10, 9, 9, 9);
        assert!(!c.same_declaration(&moved));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&LifecycleState::DeviceCreated).unwrap();
        assert_eq!(json, "\"DEVICE_CREATED\"");
        assert_eq!(LifecycleState::DeviceCreated.to_string(), "DEVICE_CREATED");
    }
}
