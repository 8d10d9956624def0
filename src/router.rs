//! Classification of device-layer events.
//!
//! The router only decides what an event means for a node.  It never
//! touches the registry or the devices itself; the worker carries out the
//! returned [`Route`].

use std::sync::Arc;

use log::debug;

use crate::device::{DeviceEvent, DeviceEventKind, DeviceRole, DeviceService};
use crate::error::{NodeError, Result};
use crate::registry::NodeRegistry;
use crate::types::{DeviceId, Node};

/// What the worker should do for a device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Re-derive the node's state and continue provisioning.
    Bootstrap(String),
    /// The node lost connectivity or a system interface.
    ForceIncomplete(String),
    Ignore,
}

pub struct DeviceEventRouter {
    registry: Arc<dyn NodeRegistry>,
    devices: Arc<dyn DeviceService>,
}

impl DeviceEventRouter {
    pub fn new(registry: Arc<dyn NodeRegistry>, devices: Arc<dyn DeviceService>) -> Self {
        Self { registry, devices }
    }

    pub async fn route(&self, event: &DeviceEvent) -> Result<Route> {
        let node = match self.owner(&event.device.id, event.device.role).await {
            Ok(node) => node,
            Err(NodeError::UnknownDevice(id)) => {
                debug!("Ignoring {:?} on {}: no owning node", event.kind, id);
                return Ok(Route::Ignore);
            }
            Err(e) => return Err(e),
        };
        let hostname = node.hostname.clone();

        let route = match event.kind {
            DeviceEventKind::DeviceAdded | DeviceEventKind::DeviceAvailabilityChanged => {
                if self.devices.is_available(&event.device.id).await {
                    Route::Bootstrap(hostname)
                } else {
                    Route::ForceIncomplete(hostname)
                }
            }
            DeviceEventKind::DeviceRemoved => Route::ForceIncomplete(hostname),
            DeviceEventKind::PortAdded
            | DeviceEventKind::PortUpdated
            | DeviceEventKind::PortRemoved => Self::route_port(&node, event),
        };
        Ok(route)
    }

    fn route_port(node: &Node, event: &DeviceEvent) -> Route {
        let Some(port) = &event.port else {
            return Route::Ignore;
        };
        if event.device.role != DeviceRole::Switch || !node.is_system_interface(&port.name) {
            debug!("Ignoring port {} on {}", port.name, event.device.id);
            return Route::Ignore;
        }
        let hostname = node.hostname.clone();
        match event.kind {
            DeviceEventKind::PortAdded => Route::Bootstrap(hostname),
            DeviceEventKind::PortUpdated if port.enabled => Route::Bootstrap(hostname),
            DeviceEventKind::PortUpdated | DeviceEventKind::PortRemoved => {
                Route::ForceIncomplete(hostname)
            }
            _ => Route::Ignore,
        }
    }

    /// Finds the node a device belongs to: by management endpoint for
    /// controller devices and by bridge for switches.
    async fn owner(&self, device: &DeviceId, role: DeviceRole) -> Result<Node> {
        self.registry
            .list()
            .await?
            .into_iter()
            .find(|node| match role {
                DeviceRole::Controller => &node.ovsdb_id() == device,
                DeviceRole::Switch => node.owns_bridge(device),
            })
            .ok_or_else(|| NodeError::UnknownDevice(device.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, OvsdbController, Port, SimulatedFabric};
    use crate::registry::MemoryNodeRegistry;
    use crate::types::fixtures::{compute, gateway};
    use crate::types::MacAddr;

    async fn setup() -> (DeviceEventRouter, SimulatedFabric) {
        let registry = MemoryNodeRegistry::new();
        registry.put(compute("compute-01", 1)).await.unwrap();
        registry.put(gateway("gateway-01", 2)).await.unwrap();
        let fabric = SimulatedFabric::new();
        let router = DeviceEventRouter::new(Arc::new(registry), Arc::new(fabric.clone()));
        (router, fabric)
    }

    fn port_event(kind: DeviceEventKind, bridge: &str, name: &str, enabled: bool) -> DeviceEvent {
        DeviceEvent {
            kind,
            device: Device {
                id: DeviceId::new(bridge),
                role: DeviceRole::Switch,
            },
            port: Some(Port {
                name: name.into(),
                number: 1,
                enabled,
                mac: MacAddr([2, 0, 0, 0, 0, 1]),
            }),
        }
    }

    #[tokio::test]
    async fn test_endpoint_events_follow_availability() {
        let (router, fabric) = setup().await;
        let ip = std::net::Ipv4Addr::new(10, 0, 0, 1);
        let event = DeviceEvent {
            kind: DeviceEventKind::DeviceAvailabilityChanged,
            device: Device {
                id: DeviceId::ovsdb(ip),
                role: DeviceRole::Controller,
            },
            port: None,
        };

        assert_eq!(
            router.route(&event).await.unwrap(),
            Route::ForceIncomplete("compute-01".into())
        );
        fabric.connect(ip, 6640).await;
        assert_eq!(
            router.route(&event).await.unwrap(),
            Route::Bootstrap("compute-01".into())
        );
    }

    #[tokio::test]
    async fn test_system_interface_ports() {
        let (router, _) = setup().await;
        let router_bridge = "of:0000000000000102";

        let added = port_event(DeviceEventKind::PortAdded, router_bridge, "eth1", true);
        assert_eq!(
            router.route(&added).await.unwrap(),
            Route::Bootstrap("gateway-01".into())
        );
        let removed = port_event(DeviceEventKind::PortRemoved, router_bridge, "eth1", true);
        assert_eq!(
            router.route(&removed).await.unwrap(),
            Route::ForceIncomplete("gateway-01".into())
        );
        let disabled = port_event(
            DeviceEventKind::PortUpdated,
            "of:0000000000000001",
            "vxlan",
            false,
        );
        assert_eq!(
            router.route(&disabled).await.unwrap(),
            Route::ForceIncomplete("compute-01".into())
        );
    }

    #[tokio::test]
    async fn test_irrelevant_events_are_ignored() {
        let (router, _) = setup().await;
        let tap = port_event(DeviceEventKind::PortRemoved, "of:0000000000000001", "tap0", true);
        assert_eq!(router.route(&tap).await.unwrap(), Route::Ignore);

        let stranger = port_event(DeviceEventKind::PortAdded, "of:00000000000000ff", "vxlan", true);
        assert_eq!(router.route(&stranger).await.unwrap(), Route::Ignore);
    }
}
