//! Device-management collaborators.
//!
//! The controller never talks to a switch directly.  It asks a
//! [`DriverService`] for a capability on a management endpoint and gets
//! `None` back when the device cannot provide it; callers treat that as
//! [`NodeError::CapabilityMissing`](crate::error::NodeError::CapabilityMissing).

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ControllerInfo, DeviceId, ListenerId, MacAddr};

pub mod sim;
pub use sim::SimulatedFabric;

pub type PortNumber = u32;

/// Whether a device is a management endpoint or a switching bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Management endpoint (OVSDB server) of a host.
    Controller,
    /// A virtual switch instance.
    Switch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub role: DeviceRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub number: PortNumber,
    pub enabled: bool,
    pub mac: MacAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    DeviceAdded,
    DeviceAvailabilityChanged,
    DeviceRemoved,
    PortAdded,
    PortUpdated,
    PortRemoved,
}

/// An event reported by the device layer.  Port events carry the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: Device,
    pub port: Option<Port>,
}

pub type DeviceListener = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

#[async_trait]
pub trait DeviceService: Send + Sync {
    async fn device(&self, id: &DeviceId) -> Option<Device>;

    async fn is_available(&self, id: &DeviceId) -> bool;

    async fn ports(&self, id: &DeviceId) -> Vec<Port>;

    async fn port(&self, id: &DeviceId, name: &str) -> Option<Port> {
        self.ports(id).await.into_iter().find(|p| p.name == name)
    }

    /// True if `id` is available and has an enabled port called `name`.
    async fn is_port_enabled(&self, id: &DeviceId, name: &str) -> bool {
        if !self.is_available(id).await {
            return false;
        }
        self.port(id, name).await.map_or(false, |p| p.enabled)
    }

    fn add_listener(&self, listener: DeviceListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// Connections to management endpoints.
#[async_trait]
pub trait OvsdbController: Send + Sync {
    async fn is_connected(&self, ip: Ipv4Addr, port: u16) -> bool;

    /// Requests a connection.  Completion is reported as a device event.
    async fn connect(&self, ip: Ipv4Addr, port: u16);

    async fn disconnect(&self, ip: Ipv4Addr, port: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailMode {
    Secure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDescription {
    pub name: String,
    pub datapath_id: String,
    pub fail_mode: FailMode,
    pub disable_in_band: bool,
    pub controllers: Vec<ControllerInfo>,
}

/// Bridge management on a host, addressed by its management endpoint.
#[async_trait]
pub trait BridgeConfig: Send + Sync {
    async fn bridges(&self, ovsdb: &DeviceId) -> BTreeSet<String>;

    async fn add_bridge(&self, ovsdb: &DeviceId, bridge: BridgeDescription) -> Result<()>;

    /// Every port on every bridge of the host, with its enabled flag.
    async fn ports(&self, ovsdb: &DeviceId) -> Vec<(String, bool)>;

    async fn add_port(&self, ovsdb: &DeviceId, bridge_name: &str, port_name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Vxlan,
}

/// How the remote end (or key) of a tunnel is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEndpoint {
    /// Set per flow by the forwarding pipeline.
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKey {
    Flow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescription {
    pub bridge: String,
    pub name: String,
    pub tunnel_type: TunnelType,
    pub remote: TunnelEndpoint,
    pub key: TunnelKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescription {
    pub bridge: String,
    pub name: String,
    pub peer: String,
}

/// Interface management on a host, addressed by its management endpoint.
#[async_trait]
pub trait InterfaceConfig: Send + Sync {
    async fn add_tunnel_interface(&self, ovsdb: &DeviceId, tunnel: TunnelDescription)
        -> Result<()>;

    async fn add_patch_pair(
        &self,
        ovsdb: &DeviceId,
        a: PatchDescription,
        b: PatchDescription,
    ) -> Result<()>;
}

/// Resolves the capabilities a management endpoint offers.
pub trait DriverService: Send + Sync {
    fn bridge_config(&self, ovsdb: &DeviceId) -> Option<Arc<dyn BridgeConfig>>;

    fn interface_config(&self, ovsdb: &DeviceId) -> Option<Arc<dyn InterfaceConfig>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub String);

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// Sets the remote endpoint of the outgoing tunnel.
    SetTunnelDst(Ipv4Addr),
    SetEthDst(MacAddr),
    Output(PortNumber),
}

/// One path of a select group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupBucket {
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    pub device: DeviceId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
    pub key: GroupKey,
    pub id: GroupId,
    pub app_id: String,
}

/// A group installed on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub device: DeviceId,
    pub id: GroupId,
    pub key: GroupKey,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
    pub app_id: String,
}

#[async_trait]
pub trait GroupService: Send + Sync {
    async fn add_group(&self, group: GroupDescription) -> Result<()>;

    async fn get_group(&self, device: &DeviceId, key: &GroupKey) -> Option<Group>;

    async fn add_buckets_to_group(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        buckets: Vec<GroupBucket>,
        app_id: &str,
    ) -> Result<()>;

    async fn remove_buckets_from_group(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        buckets: Vec<GroupBucket>,
        app_id: &str,
    ) -> Result<()>;
}
