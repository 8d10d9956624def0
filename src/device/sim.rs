//! Simulated device fabric.
//!
//! Implements every device capability the controller consumes against an
//! in-memory model of hosts, bridges, ports and groups.  Mutations report
//! device events to registered listeners exactly like a real device layer
//! would, after the internal lock is released.  Every request the
//! controller makes is recorded so callers can inspect what was
//! programmed.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info};

use super::{
    BridgeConfig, BridgeDescription, Device, DeviceEvent, DeviceEventKind, DeviceListener,
    DeviceRole, DeviceService, DriverService, Group, GroupBucket, GroupDescription, GroupKey,
    GroupService, InterfaceConfig, OvsdbController, PatchDescription, Port, PortNumber,
    TunnelDescription,
};
use crate::error::{NodeError, Result};
use crate::types::{DeviceId, ListenerId, MacAddr};

/// A request the controller issued against the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(Ipv4Addr),
    Disconnect(Ipv4Addr),
    AddBridge { host: Ipv4Addr, name: String },
    AddPort { host: Ipv4Addr, bridge: String, port: String },
    AddTunnel { host: Ipv4Addr, name: String },
    AddPatchPair { host: Ipv4Addr, a: String, b: String },
    AddGroup { device: DeviceId, key: GroupKey },
    AddBuckets { device: DeviceId, key: GroupKey, count: usize },
    RemoveBuckets { device: DeviceId, key: GroupKey, count: usize },
}

impl Call {
    /// True for calls that change device configuration.
    pub fn is_provisioning(&self) -> bool {
        !matches!(self, Call::Connect(_) | Call::Disconnect(_))
    }
}

struct SimBridge {
    device: DeviceId,
    description: Option<BridgeDescription>,
    available: bool,
    ports: Vec<Port>,
    next_port: PortNumber,
}

struct Host {
    reachable: bool,
    connected: bool,
    bridge_capable: bool,
    interface_capable: bool,
    bridges: BTreeMap<String, SimBridge>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: false,
            bridge_capable: true,
            interface_capable: true,
            bridges: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct Fabric {
    hosts: BTreeMap<Ipv4Addr, Host>,
    groups: BTreeMap<(DeviceId, GroupKey), Group>,
    calls: Vec<Call>,
    listeners: Vec<(ListenerId, DeviceListener)>,
    next_listener: u64,
}

impl Fabric {
    fn host_mut(&mut self, ovsdb: &DeviceId) -> Result<(Ipv4Addr, &mut Host)> {
        let ip = ovsdb.ovsdb_ip().ok_or_else(|| NodeError::Device {
            device: ovsdb.clone(),
            reason: "not a management endpoint".into(),
        })?;
        let host = self.hosts.get_mut(&ip).ok_or_else(|| NodeError::Device {
            device: ovsdb.clone(),
            reason: "unknown host".into(),
        })?;
        Ok((ip, host))
    }

    fn bridge(&self, id: &DeviceId) -> Option<&SimBridge> {
        self.hosts
            .values()
            .flat_map(|host| host.bridges.values())
            .find(|bridge| &bridge.device == id)
    }
}

fn controller_event(kind: DeviceEventKind, ip: Ipv4Addr) -> DeviceEvent {
    DeviceEvent {
        kind,
        device: Device {
            id: DeviceId::ovsdb(ip),
            role: DeviceRole::Controller,
        },
        port: None,
    }
}

fn switch_event(kind: DeviceEventKind, id: &DeviceId, port: Option<Port>) -> DeviceEvent {
    DeviceEvent {
        kind,
        device: Device {
            id: id.clone(),
            role: DeviceRole::Switch,
        },
        port,
    }
}

fn create_bridge(
    host: &mut Host,
    name: &str,
    device: DeviceId,
    description: Option<BridgeDescription>,
    events: &mut Vec<DeviceEvent>,
) {
    if host.bridges.contains_key(name) {
        return;
    }
    events.push(switch_event(DeviceEventKind::DeviceAdded, &device, None));
    host.bridges.insert(
        name.to_string(),
        SimBridge {
            device,
            description,
            available: true,
            ports: Vec::new(),
            next_port: 1,
        },
    );
}

fn attach_port(
    ip: Ipv4Addr,
    host: &mut Host,
    bridge_name: &str,
    port_name: &str,
    events: &mut Vec<DeviceEvent>,
) -> Result<()> {
    let bridge = host
        .bridges
        .get_mut(bridge_name)
        .ok_or_else(|| NodeError::Device {
            device: DeviceId::ovsdb(ip),
            reason: format!("no bridge {}", bridge_name),
        })?;
    if bridge.ports.iter().any(|p| p.name == port_name) {
        return Ok(());
    }
    let number = bridge.next_port;
    bridge.next_port += 1;
    let octets = ip.octets();
    let port = Port {
        name: port_name.to_string(),
        number,
        enabled: true,
        mac: MacAddr([
            0x02,
            octets[2],
            octets[3],
            bridge_name.len() as u8,
            (number >> 8) as u8,
            number as u8,
        ]),
    };
    events.push(switch_event(
        DeviceEventKind::PortAdded,
        &bridge.device,
        Some(port.clone()),
    ));
    bridge.ports.push(port);
    Ok(())
}

/// In-memory device fabric shared by every handle cloned from it.
#[derive(Clone, Default)]
pub struct SimulatedFabric {
    inner: Arc<Mutex<Fabric>>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        match self.inner.lock() {
            Ok(fabric) => fabric,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `f` under the lock and reports the events it produced once
    /// the lock is released.
    fn update<T>(&self, f: impl FnOnce(&mut Fabric, &mut Vec<DeviceEvent>) -> T) -> T {
        let mut events = Vec::new();
        let (out, listeners) = {
            let mut fabric = self.lock();
            let out = f(&mut fabric, &mut events);
            let listeners: Vec<DeviceListener> =
                fabric.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (out, listeners)
        };
        for event in &events {
            debug!("Device event {:?} on {}", event.kind, event.device.id);
            for listener in &listeners {
                listener(event);
            }
        }
        out
    }

    /// Makes the management endpoint at `ip` accept or refuse connections.
    pub fn set_reachable(&self, ip: Ipv4Addr, reachable: bool) {
        self.lock().hosts.entry(ip).or_default().reachable = reachable;
    }

    /// Toggles the bridge and interface capabilities of a host.
    pub fn set_capabilities(&self, ip: Ipv4Addr, bridge: bool, interface: bool) {
        let mut fabric = self.lock();
        let host = fabric.hosts.entry(ip).or_default();
        host.bridge_capable = bridge;
        host.interface_capable = interface;
    }

    /// Creates a bridge out of band, as an operator would.
    pub fn install_bridge(&self, ip: Ipv4Addr, name: &str, device: DeviceId) {
        self.update(|fabric, events| {
            let host = fabric.hosts.entry(ip).or_default();
            create_bridge(host, name, device, None, events);
        });
    }

    /// Adds a port out of band.
    pub fn install_port(&self, ip: Ipv4Addr, bridge_name: &str, port_name: &str) -> Result<()> {
        self.update(|fabric, events| {
            let host = fabric.hosts.entry(ip).or_default();
            attach_port(ip, host, bridge_name, port_name, events)
        })
    }

    /// Deletes a port out of band.
    pub fn remove_port(&self, ip: Ipv4Addr, bridge_name: &str, port_name: &str) {
        self.update(|fabric, events| {
            let Some(bridge) = fabric
                .hosts
                .get_mut(&ip)
                .and_then(|host| host.bridges.get_mut(bridge_name))
            else {
                return;
            };
            if let Some(pos) = bridge.ports.iter().position(|p| p.name == port_name) {
                let port = bridge.ports.remove(pos);
                events.push(switch_event(
                    DeviceEventKind::PortRemoved,
                    &bridge.device,
                    Some(port),
                ));
            }
        });
    }

    pub fn set_port_enabled(&self, ip: Ipv4Addr, bridge_name: &str, port_name: &str, enabled: bool) {
        self.update(|fabric, events| {
            let Some(bridge) = fabric
                .hosts
                .get_mut(&ip)
                .and_then(|host| host.bridges.get_mut(bridge_name))
            else {
                return;
            };
            let device = bridge.device.clone();
            if let Some(port) = bridge.ports.iter_mut().find(|p| p.name == port_name) {
                port.enabled = enabled;
                events.push(switch_event(
                    DeviceEventKind::PortUpdated,
                    &device,
                    Some(port.clone()),
                ));
            }
        });
    }

    pub fn set_bridge_available(&self, ip: Ipv4Addr, bridge_name: &str, available: bool) {
        self.update(|fabric, events| {
            let Some(bridge) = fabric
                .hosts
                .get_mut(&ip)
                .and_then(|host| host.bridges.get_mut(bridge_name))
            else {
                return;
            };
            if bridge.available != available {
                bridge.available = available;
                events.push(switch_event(
                    DeviceEventKind::DeviceAvailabilityChanged,
                    &bridge.device,
                    None,
                ));
            }
        });
    }

    /// Drops the management connection of a host without a request.
    pub fn drop_connection(&self, ip: Ipv4Addr) {
        self.update(|fabric, events| {
            if let Some(host) = fabric.hosts.get_mut(&ip) {
                if host.connected {
                    host.connected = false;
                    events.push(controller_event(
                        DeviceEventKind::DeviceAvailabilityChanged,
                        ip,
                    ));
                }
            }
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn provisioning_calls(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_provisioning())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Description a bridge was created with, if the controller created it.
    pub fn bridge_description(&self, ip: Ipv4Addr, name: &str) -> Option<BridgeDescription> {
        self.lock()
            .hosts
            .get(&ip)
            .and_then(|host| host.bridges.get(name))
            .and_then(|bridge| bridge.description.clone())
    }

    pub fn groups(&self) -> Vec<Group> {
        self.lock().groups.values().cloned().collect()
    }
}

#[async_trait]
impl DeviceService for SimulatedFabric {
    async fn device(&self, id: &DeviceId) -> Option<Device> {
        let fabric = self.lock();
        if let Some(ip) = id.ovsdb_ip() {
            return fabric
                .hosts
                .get(&ip)
                .filter(|host| host.connected)
                .map(|_| Device {
                    id: id.clone(),
                    role: DeviceRole::Controller,
                });
        }
        fabric.bridge(id).map(|_| Device {
            id: id.clone(),
            role: DeviceRole::Switch,
        })
    }

    async fn is_available(&self, id: &DeviceId) -> bool {
        let fabric = self.lock();
        if let Some(ip) = id.ovsdb_ip() {
            return fabric.hosts.get(&ip).map_or(false, |host| host.connected);
        }
        fabric.bridge(id).map_or(false, |bridge| bridge.available)
    }

    async fn ports(&self, id: &DeviceId) -> Vec<Port> {
        self.lock()
            .bridge(id)
            .map(|bridge| bridge.ports.clone())
            .unwrap_or_default()
    }

    fn add_listener(&self, listener: DeviceListener) -> ListenerId {
        let mut fabric = self.lock();
        let id = ListenerId(fabric.next_listener);
        fabric.next_listener += 1;
        fabric.listeners.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

#[async_trait]
impl OvsdbController for SimulatedFabric {
    async fn is_connected(&self, ip: Ipv4Addr, _port: u16) -> bool {
        self.lock().hosts.get(&ip).map_or(false, |host| host.connected)
    }

    async fn connect(&self, ip: Ipv4Addr, port: u16) {
        self.update(|fabric, events| {
            fabric.calls.push(Call::Connect(ip));
            let host = fabric.hosts.entry(ip).or_default();
            if !host.reachable {
                debug!("Connection to {}:{} refused", ip, port);
                return;
            }
            if !host.connected {
                host.connected = true;
                info!("Management endpoint {}:{} connected", ip, port);
                events.push(controller_event(DeviceEventKind::DeviceAdded, ip));
            }
        });
    }

    async fn disconnect(&self, ip: Ipv4Addr, _port: u16) {
        self.update(|fabric, events| {
            fabric.calls.push(Call::Disconnect(ip));
            if let Some(host) = fabric.hosts.get_mut(&ip) {
                if host.connected {
                    host.connected = false;
                    events.push(controller_event(
                        DeviceEventKind::DeviceAvailabilityChanged,
                        ip,
                    ));
                }
            }
        });
    }
}

impl DriverService for SimulatedFabric {
    fn bridge_config(&self, ovsdb: &DeviceId) -> Option<Arc<dyn BridgeConfig>> {
        let ip = ovsdb.ovsdb_ip()?;
        let capable = self
            .lock()
            .hosts
            .get(&ip)
            .map_or(false, |host| host.connected && host.bridge_capable);
        capable.then(|| Arc::new(self.clone()) as Arc<dyn BridgeConfig>)
    }

    fn interface_config(&self, ovsdb: &DeviceId) -> Option<Arc<dyn InterfaceConfig>> {
        let ip = ovsdb.ovsdb_ip()?;
        let capable = self
            .lock()
            .hosts
            .get(&ip)
            .map_or(false, |host| host.connected && host.interface_capable);
        capable.then(|| Arc::new(self.clone()) as Arc<dyn InterfaceConfig>)
    }
}

#[async_trait]
impl BridgeConfig for SimulatedFabric {
    async fn bridges(&self, ovsdb: &DeviceId) -> BTreeSet<String> {
        let Some(ip) = ovsdb.ovsdb_ip() else {
            return BTreeSet::new();
        };
        self.lock()
            .hosts
            .get(&ip)
            .map(|host| host.bridges.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn add_bridge(&self, ovsdb: &DeviceId, bridge: BridgeDescription) -> Result<()> {
        self.update(|fabric, events| {
            let (ip, host) = fabric.host_mut(ovsdb)?;
            let name = bridge.name.clone();
            let device = DeviceId::new(format!("of:{}", bridge.datapath_id));
            create_bridge(host, &name, device, Some(bridge), events);
            fabric.calls.push(Call::AddBridge { host: ip, name });
            Ok(())
        })
    }

    async fn ports(&self, ovsdb: &DeviceId) -> Vec<(String, bool)> {
        let Some(ip) = ovsdb.ovsdb_ip() else {
            return Vec::new();
        };
        self.lock()
            .hosts
            .get(&ip)
            .map(|host| {
                host.bridges
                    .values()
                    .flat_map(|bridge| bridge.ports.iter())
                    .map(|port| (port.name.clone(), port.enabled))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn add_port(&self, ovsdb: &DeviceId, bridge_name: &str, port_name: &str) -> Result<()> {
        self.update(|fabric, events| {
            let (ip, host) = fabric.host_mut(ovsdb)?;
            attach_port(ip, host, bridge_name, port_name, events)?;
            fabric.calls.push(Call::AddPort {
                host: ip,
                bridge: bridge_name.to_string(),
                port: port_name.to_string(),
            });
            Ok(())
        })
    }
}

#[async_trait]
impl InterfaceConfig for SimulatedFabric {
    async fn add_tunnel_interface(
        &self,
        ovsdb: &DeviceId,
        tunnel: TunnelDescription,
    ) -> Result<()> {
        self.update(|fabric, events| {
            let (ip, host) = fabric.host_mut(ovsdb)?;
            attach_port(ip, host, &tunnel.bridge, &tunnel.name, events)?;
            fabric.calls.push(Call::AddTunnel {
                host: ip,
                name: tunnel.name,
            });
            Ok(())
        })
    }

    async fn add_patch_pair(
        &self,
        ovsdb: &DeviceId,
        a: PatchDescription,
        b: PatchDescription,
    ) -> Result<()> {
        self.update(|fabric, events| {
            let (ip, host) = fabric.host_mut(ovsdb)?;
            attach_port(ip, host, &a.bridge, &a.name, events)?;
            attach_port(ip, host, &b.bridge, &b.name, events)?;
            fabric.calls.push(Call::AddPatchPair {
                host: ip,
                a: a.name,
                b: b.name,
            });
            Ok(())
        })
    }
}

#[async_trait]
impl GroupService for SimulatedFabric {
    async fn add_group(&self, group: GroupDescription) -> Result<()> {
        let mut fabric = self.lock();
        fabric.calls.push(Call::AddGroup {
            device: group.device.clone(),
            key: group.key.clone(),
        });
        let slot = (group.device.clone(), group.key.clone());
        if fabric.groups.contains_key(&slot) {
            return Err(NodeError::Device {
                device: group.device,
                reason: format!("group {} already exists", group.key),
            });
        }
        fabric.groups.insert(
            slot,
            Group {
                device: group.device,
                id: group.id,
                key: group.key,
                group_type: group.group_type,
                buckets: group.buckets,
                app_id: group.app_id,
            },
        );
        Ok(())
    }

    async fn get_group(&self, device: &DeviceId, key: &GroupKey) -> Option<Group> {
        self.lock()
            .groups
            .get(&(device.clone(), key.clone()))
            .cloned()
    }

    async fn add_buckets_to_group(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        buckets: Vec<GroupBucket>,
        _app_id: &str,
    ) -> Result<()> {
        let mut fabric = self.lock();
        fabric.calls.push(Call::AddBuckets {
            device: device.clone(),
            key: key.clone(),
            count: buckets.len(),
        });
        let group = fabric
            .groups
            .get_mut(&(device.clone(), key.clone()))
            .ok_or_else(|| NodeError::Device {
                device: device.clone(),
                reason: format!("no group {}", key),
            })?;
        for bucket in buckets {
            if !group.buckets.contains(&bucket) {
                group.buckets.push(bucket);
            }
        }
        Ok(())
    }

    async fn remove_buckets_from_group(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        buckets: Vec<GroupBucket>,
        _app_id: &str,
    ) -> Result<()> {
        let mut fabric = self.lock();
        fabric.calls.push(Call::RemoveBuckets {
            device: device.clone(),
            key: key.clone(),
            count: buckets.len(),
        });
        let group = fabric
            .groups
            .get_mut(&(device.clone(), key.clone()))
            .ok_or_else(|| NodeError::Device {
                device: device.clone(),
                reason: format!("no group {}", key),
            })?;
        group.buckets.retain(|b| !buckets.contains(b));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FailMode;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn recorder(fabric: &SimulatedFabric) -> Arc<Mutex<Vec<DeviceEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fabric.add_listener(Arc::new(move |e: &DeviceEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        seen
    }

    #[tokio::test]
    async fn test_connect_honours_reachability() {
        let fabric = SimulatedFabric::new();
        let seen = recorder(&fabric);

        fabric.set_reachable(HOST, false);
        fabric.connect(HOST, 6640).await;
        assert!(!fabric.is_connected(HOST, 6640).await);
        assert!(seen.lock().unwrap().is_empty());

        fabric.set_reachable(HOST, true);
        fabric.connect(HOST, 6640).await;
        assert!(fabric.is_available(&DeviceId::ovsdb(HOST)).await);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device.role, DeviceRole::Controller);
        assert_eq!(fabric.calls(), vec![Call::Connect(HOST), Call::Connect(HOST)]);
    }

    #[tokio::test]
    async fn test_bridge_and_port_creation_emit_events() {
        let fabric = SimulatedFabric::new();
        fabric.connect(HOST, 6640).await;
        let seen = recorder(&fabric);

        let ovsdb = DeviceId::ovsdb(HOST);
        let bridge_config = fabric.bridge_config(&ovsdb).unwrap();
        bridge_config
            .add_bridge(
                &ovsdb,
                BridgeDescription {
                    name: "br-int".into(),
                    datapath_id: "0000000000000001".into(),
                    fail_mode: FailMode::Secure,
                    disable_in_band: true,
                    controllers: vec![],
                },
            )
            .await
            .unwrap();
        bridge_config.add_port(&ovsdb, "br-int", "eth2").await.unwrap();
        // Second add is a no-op on the device.
        bridge_config.add_port(&ovsdb, "br-int", "eth2").await.unwrap();

        let bridge = DeviceId::new("of:0000000000000001");
        assert!(fabric.is_available(&bridge).await);
        assert!(fabric.is_port_enabled(&bridge, "eth2").await);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(bridge_config.add_port(&ovsdb, "br-nope", "eth3").await.is_err());
    }

    #[tokio::test]
    async fn test_capabilities_can_be_withdrawn() {
        let fabric = SimulatedFabric::new();
        let ovsdb = DeviceId::ovsdb(HOST);
        assert!(fabric.bridge_config(&ovsdb).is_none());

        fabric.connect(HOST, 6640).await;
        assert!(fabric.bridge_config(&ovsdb).is_some());

        fabric.set_capabilities(HOST, false, true);
        assert!(fabric.bridge_config(&ovsdb).is_none());
        assert!(fabric.interface_config(&ovsdb).is_some());
    }
}
