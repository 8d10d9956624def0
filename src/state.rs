//! Lifecycle state derivation.
//!
//! [`derive_state`] is a pure function over a [`DeviceFacts`] snapshot.
//! The snapshot is taken once per evaluation by [`collect_facts`] so a
//! derivation never mixes facts observed at different times.

use std::collections::BTreeSet;

use crate::device::{DeviceService, DriverService, OvsdbController};
use crate::types::{
    LifecycleState, Node, DEFAULT_TUNNEL, PATCH_INTG_BRIDGE, PATCH_ROUT_BRIDGE, ROUTER_BRIDGE,
};

/// What the device layer reports about one host at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFacts {
    pub endpoint_connected: bool,
    pub integration_bridge_available: bool,
    /// The router bridge is listed on the management endpoint.
    pub router_bridge_created: bool,
    /// Enabled ports of the integration bridge.
    pub integration_ports: BTreeSet<String>,
    /// Every port on every bridge of the host, enabled or not.
    pub host_ports: BTreeSet<String>,
}

impl DeviceFacts {
    pub fn port_enabled(&self, name: &str) -> bool {
        self.integration_ports.contains(name)
    }

    pub fn has_port(&self, name: &str) -> bool {
        self.host_ports.contains(name)
    }
}

pub async fn collect_facts(
    node: &Node,
    ovsdb: &dyn OvsdbController,
    devices: &dyn DeviceService,
    drivers: &dyn DriverService,
) -> DeviceFacts {
    let endpoint_connected = ovsdb
        .is_connected(node.management_ip, node.management_port)
        .await;
    let integration_bridge_available = devices.is_available(&node.integration_bridge).await;

    let integration_ports = if integration_bridge_available {
        devices
            .ports(&node.integration_bridge)
            .await
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| p.name)
            .collect()
    } else {
        BTreeSet::new()
    };

    let mut facts = DeviceFacts {
        endpoint_connected,
        integration_bridge_available,
        integration_ports,
        ..Default::default()
    };

    if !endpoint_connected {
        return facts;
    }
    let ovsdb_id = node.ovsdb_id();
    if let Some(bridges) = drivers.bridge_config(&ovsdb_id) {
        if node.is_gateway() {
            facts.router_bridge_created = bridges.bridges(&ovsdb_id).await.contains(ROUTER_BRIDGE);
        }
        facts.host_ports = bridges
            .ports(&ovsdb_id)
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
    }
    facts
}

/// Maps a node and a facts snapshot to its lifecycle state.
///
/// Checks run top to bottom and the first failing one decides:
///
/// 1. endpoint connected and integration bridge available, else `INIT`
/// 2. for a gateway, router bridge present, else `INIT`
/// 3. tunnel enabled when a tunnel address is declared and the VLAN port
///    enabled when one is declared, else `DEVICE_CREATED`
/// 4. for a gateway, `patch-intg` enabled with `patch-rout` and the
///    uplink present on the host, else `DEVICE_CREATED`
/// 5. `COMPLETE`
pub fn derive_state(node: &Node, facts: &DeviceFacts) -> LifecycleState {
    if !(facts.endpoint_connected && facts.integration_bridge_available) {
        return LifecycleState::Init;
    }
    if node.is_gateway() && !facts.router_bridge_created {
        return LifecycleState::Init;
    }

    if node.data_ip.is_some() && !facts.port_enabled(DEFAULT_TUNNEL) {
        return LifecycleState::DeviceCreated;
    }
    if let Some(vlan) = &node.vlan_intf {
        if !facts.port_enabled(vlan) {
            return LifecycleState::DeviceCreated;
        }
    }

    if let Some(uplink) = node.uplink_port() {
        if !facts.port_enabled(PATCH_INTG_BRIDGE)
            || !facts.has_port(PATCH_ROUT_BRIDGE)
            || !facts.has_port(uplink)
        {
            return LifecycleState::DeviceCreated;
        }
    }

    LifecycleState::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{compute, gateway};

    fn facts(connected: bool, bridge: bool, router: bool, ports: &[&str]) -> DeviceFacts {
        DeviceFacts {
            endpoint_connected: connected,
            integration_bridge_available: bridge,
            router_bridge_created: router,
            integration_ports: ports.iter().map(|p| p.to_string()).collect(),
            host_ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_compute_table() {
        let node = compute("compute-01", 1);
        let cases = [
            (facts(false, false, false, &[]), LifecycleState::Init),
            (facts(false, true, false, &["vxlan"]), LifecycleState::Init),
            (facts(true, false, false, &[]), LifecycleState::Init),
            (facts(true, true, false, &[]), LifecycleState::DeviceCreated),
            (facts(true, true, false, &["vxlan"]), LifecycleState::Complete),
        ];
        for (facts, expected) in cases {
            assert_eq!(derive_state(&node, &facts), expected, "{:?}", facts);
        }
    }

    #[test]
    fn test_gateway_table() {
        let node = gateway("gateway-01", 2);
        let all = ["vxlan", PATCH_INTG_BRIDGE, PATCH_ROUT_BRIDGE, "eth1"];
        let cases = [
            (facts(true, true, false, &all), LifecycleState::Init),
            (facts(true, true, true, &[]), LifecycleState::DeviceCreated),
            (
                facts(true, true, true, &["vxlan", PATCH_INTG_BRIDGE, PATCH_ROUT_BRIDGE]),
                LifecycleState::DeviceCreated,
            ),
            (facts(true, true, true, &["vxlan", "eth1"]), LifecycleState::DeviceCreated),
            (facts(true, true, true, &all), LifecycleState::Complete),
        ];
        for (facts, expected) in cases {
            assert_eq!(derive_state(&node, &facts), expected, "{:?}", facts);
        }
    }

    #[test]
    fn test_disabled_tunnel_is_not_enough() {
        let node = compute("compute-01", 1);
        let mut f = facts(true, true, false, &[]);
        f.host_ports.insert(DEFAULT_TUNNEL.into());
        assert_eq!(derive_state(&node, &f), LifecycleState::DeviceCreated);
    }

    #[test]
    fn test_vlan_only_compute_needs_no_tunnel() {
        let mut node = compute("compute-01", 1);
        node.data_ip = None;
        node.vlan_intf = Some("eth2".into());
        assert_eq!(
            derive_state(&node, &facts(true, true, false, &[])),
            LifecycleState::DeviceCreated
        );
        assert_eq!(
            derive_state(&node, &facts(true, true, false, &["eth2"])),
            LifecycleState::Complete
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let node = gateway("gateway-01", 2);
        let f = facts(true, true, true, &["vxlan"]);
        let first = derive_state(&node, &f);
        for _ in 0..16 {
            assert_eq!(derive_state(&node, &f), first);
        }
    }
}
