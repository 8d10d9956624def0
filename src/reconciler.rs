//! Node state machine.
//!
//! Each lifecycle state maps to exactly one handler (see
//! [`Reconciler::process`]).  A handler performs the check-before-create
//! provisioning its state needs and says whether the node should be
//! re-derived afterwards.  Bridge creation produces no port event to wake
//! the controller again, so the re-derivation happens inline.

use std::sync::Arc;

use log::{debug, info, log};

use crate::controller::Services;
use crate::device::{
    BridgeConfig, BridgeDescription, FailMode, InterfaceConfig, PatchDescription,
    TunnelDescription, TunnelEndpoint, TunnelKey, TunnelType,
};
use crate::error::{NodeError, Result};
use crate::state::{collect_facts, derive_state, DeviceFacts};
use crate::types::{
    ControllerInfo, LifecycleState, Node, DEFAULT_TUNNEL, INTEGRATION_BRIDGE, PATCH_INTG_BRIDGE,
    PATCH_ROUT_BRIDGE, ROUTER_BRIDGE,
};

/// Upper bound on derive/act rounds per trigger.  Each productive round
/// advances the state, so a healthy node needs at most three.
const MAX_ROUNDS: usize = 8;

/// Outcome of one state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Provisioning may have changed the facts; derive again.
    Rederive,
    /// Nothing more to do until the next event.
    Done,
}

pub struct Reconciler {
    services: Services,
    openflow_port: u16,
}

impl Reconciler {
    pub fn new(services: Services, openflow_port: u16) -> Self {
        Self {
            services,
            openflow_port,
        }
    }

    pub async fn facts(&self, node: &Node) -> DeviceFacts {
        collect_facts(
            node,
            self.services.ovsdb.as_ref(),
            self.services.devices.as_ref(),
            self.services.drivers.as_ref(),
        )
        .await
    }

    /// Re-derives the node's state from the device layer, persists it and
    /// drives the state machine until it settles.
    pub async fn bootstrap(&self, hostname: &str) -> Result<()> {
        let Some(node) = self.services.registry.get(hostname).await? else {
            debug!("Node {} is gone, nothing to bootstrap", hostname);
            return Ok(());
        };
        let derived = derive_state(&node, &self.facts(&node).await);
        let Some(node) = self.set_state(hostname, derived).await? else {
            return Ok(());
        };
        self.drive(node).await
    }

    /// Forces a node back to `INIT` and runs the state machine from there.
    pub async fn init_node(&self, hostname: &str) -> Result<()> {
        let Some(node) = self.set_state(hostname, LifecycleState::Init).await? else {
            return Err(NodeError::Registry(format!("no node named {}", hostname)));
        };
        info!("Re-initializing node {}", hostname);
        self.drive(node).await
    }

    /// Marks a node `INCOMPLETE` unless it already is.
    pub async fn force_incomplete(&self, hostname: &str) -> Result<()> {
        self.set_state(hostname, LifecycleState::Incomplete).await?;
        Ok(())
    }

    async fn drive(&self, mut node: Node) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            let facts = self.facts(&node).await;
            if self.process(&node, &facts).await? == Step::Done {
                return Ok(());
            }
            let derived = derive_state(&node, &self.facts(&node).await);
            if derived == node.state {
                debug!("Node {} stays {}", node.hostname, derived);
                return Ok(());
            }
            node = match self.set_state(&node.hostname, derived).await? {
                Some(node) => node,
                None => return Ok(()),
            };
        }
        debug!("Node {} still settling, waiting for events", node.hostname);
        Ok(())
    }

    /// Runs the handler attached to the node's current state.
    pub async fn process(&self, node: &Node, facts: &DeviceFacts) -> Result<Step> {
        match node.state {
            LifecycleState::Init => self.process_init(node, facts).await,
            LifecycleState::DeviceCreated => self.process_device_created(node, facts).await,
            LifecycleState::Complete => {
                info!("Finished initializing {}", node.hostname);
                Ok(Step::Done)
            }
            LifecycleState::Incomplete => Ok(Step::Done),
        }
    }

    async fn process_init(&self, node: &Node, facts: &DeviceFacts) -> Result<Step> {
        if !facts.endpoint_connected {
            self.connect(node).await;
            return Ok(Step::Done);
        }
        if !facts.integration_bridge_available {
            let bridges = self.bridge_config(node)?;
            bridges
                .add_bridge(&node.ovsdb_id(), self.integration_bridge(node))
                .await?;
            info!("Created {} on {}", INTEGRATION_BRIDGE, node.hostname);
        }
        if let Some(gw) = &node.gateway {
            if !facts.router_bridge_created {
                let bridges = self.bridge_config(node)?;
                let description = BridgeDescription {
                    name: ROUTER_BRIDGE.into(),
                    datapath_id: gw.router_bridge.datapath_id().into(),
                    fail_mode: FailMode::Secure,
                    disable_in_band: true,
                    controllers: gw.router_controllers.clone().unwrap_or_default(),
                };
                bridges.add_bridge(&node.ovsdb_id(), description).await?;
                info!("Created {} on {}", ROUTER_BRIDGE, node.hostname);
            }
        }
        Ok(Step::Rederive)
    }

    async fn process_device_created(&self, node: &Node, facts: &DeviceFacts) -> Result<Step> {
        if !facts.endpoint_connected {
            self.connect(node).await;
            return Ok(Step::Done);
        }
        let ovsdb = node.ovsdb_id();

        if node.is_gateway()
            && (!facts.has_port(PATCH_INTG_BRIDGE) || !facts.has_port(PATCH_ROUT_BRIDGE))
        {
            self.interface_config(node)?
                .add_patch_pair(
                    &ovsdb,
                    PatchDescription {
                        bridge: INTEGRATION_BRIDGE.into(),
                        name: PATCH_INTG_BRIDGE.into(),
                        peer: PATCH_ROUT_BRIDGE.into(),
                    },
                    PatchDescription {
                        bridge: ROUTER_BRIDGE.into(),
                        name: PATCH_ROUT_BRIDGE.into(),
                        peer: PATCH_INTG_BRIDGE.into(),
                    },
                )
                .await?;
            info!("Created patch pair on {}", node.hostname);
        }

        if node.data_ip.is_some() && !facts.has_port(DEFAULT_TUNNEL) {
            self.interface_config(node)?
                .add_tunnel_interface(
                    &ovsdb,
                    TunnelDescription {
                        bridge: INTEGRATION_BRIDGE.into(),
                        name: DEFAULT_TUNNEL.into(),
                        tunnel_type: TunnelType::Vxlan,
                        remote: TunnelEndpoint::Flow,
                        key: TunnelKey::Flow,
                    },
                )
                .await?;
            info!("Created tunnel interface on {}", node.hostname);
        }

        if let Some(vlan) = &node.vlan_intf {
            if !facts.has_port(vlan) {
                self.bridge_config(node)?
                    .add_port(&ovsdb, INTEGRATION_BRIDGE, vlan)
                    .await?;
                info!("Attached {} to {} on {}", vlan, INTEGRATION_BRIDGE, node.hostname);
            }
        }

        if let Some(uplink) = node.uplink_port() {
            if !facts.has_port(uplink) {
                self.bridge_config(node)?
                    .add_port(&ovsdb, ROUTER_BRIDGE, uplink)
                    .await?;
                info!("Attached {} to {} on {}", uplink, ROUTER_BRIDGE, node.hostname);
            }
        }

        Ok(Step::Rederive)
    }

    /// Re-reads the node and stores it with `state` if that differs.
    /// Returns the stored node, or `None` if it no longer exists.
    pub async fn set_state(&self, hostname: &str, state: LifecycleState) -> Result<Option<Node>> {
        let Some(current) = self.services.registry.get(hostname).await? else {
            return Ok(None);
        };
        if current.state == state {
            return Ok(Some(current));
        }
        let updated = current.with_state(state);
        self.services.registry.put(updated.clone()).await?;
        info!("Node {} is now {}", hostname, state);
        Ok(Some(updated))
    }

    async fn connect(&self, node: &Node) {
        let unreachable = NodeError::Connectivity {
            hostname: node.hostname.clone(),
        };
        log!(
            unreachable.level(),
            "{}, connecting to {}:{}",
            unreachable,
            node.management_ip,
            node.management_port
        );
        self.services
            .ovsdb
            .connect(node.management_ip, node.management_port)
            .await;
    }

    fn integration_bridge(&self, node: &Node) -> BridgeDescription {
        let controllers = self
            .services
            .cluster
            .member_addresses()
            .into_iter()
            .map(|ip| ControllerInfo::tcp(ip, self.openflow_port))
            .collect();
        BridgeDescription {
            name: INTEGRATION_BRIDGE.into(),
            datapath_id: node.integration_bridge.datapath_id().into(),
            fail_mode: FailMode::Secure,
            disable_in_band: true,
            controllers,
        }
    }

    fn bridge_config(&self, node: &Node) -> Result<Arc<dyn BridgeConfig>> {
        let ovsdb = node.ovsdb_id();
        self.services
            .drivers
            .bridge_config(&ovsdb)
            .ok_or(NodeError::CapabilityMissing {
                device: ovsdb,
                capability: "bridge configuration",
            })
    }

    fn interface_config(&self, node: &Node) -> Result<Arc<dyn InterfaceConfig>> {
        let ovsdb = node.ovsdb_id();
        self.services
            .drivers
            .interface_config(&ovsdb)
            .ok_or(NodeError::CapabilityMissing {
                device: ovsdb,
                capability: "interface configuration",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::cluster::{LocalCluster, MemberId};
    use crate::device::sim::Call;
    use crate::device::{OvsdbController, SimulatedFabric};
    use crate::registry::{MemoryNodeRegistry, NodeRegistry};
    use crate::types::fixtures::{compute, gateway};

    struct Harness {
        registry: MemoryNodeRegistry,
        fabric: SimulatedFabric,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let registry = MemoryNodeRegistry::new();
        let fabric = SimulatedFabric::new();
        let cluster = LocalCluster::new(
            MemberId::new("local"),
            IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)),
        );
        let services = Services::simulated(registry.clone(), cluster, fabric.clone());
        Harness {
            registry,
            fabric,
            reconciler: Reconciler::new(services, 6653),
        }
    }

    async fn state_of(h: &Harness, hostname: &str) -> LifecycleState {
        h.registry.get(hostname).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_requests_connection_once() {
        let h = harness();
        let node = compute("compute-01", 1);
        h.fabric.set_reachable(node.management_ip, false);
        h.registry.put(node.clone()).await.unwrap();

        h.reconciler.bootstrap("compute-01").await.unwrap();

        assert_eq!(state_of(&h, "compute-01").await, LifecycleState::Init);
        assert_eq!(h.fabric.calls(), vec![Call::Connect(node.management_ip)]);
    }

    #[tokio::test]
    async fn test_connected_compute_runs_to_complete() {
        let h = harness();
        let node = compute("compute-01", 1);
        h.fabric.connect(node.management_ip, 6640).await;
        h.registry.put(node.clone()).await.unwrap();

        h.reconciler.bootstrap("compute-01").await.unwrap();

        assert_eq!(state_of(&h, "compute-01").await, LifecycleState::Complete);
        let description = h
            .fabric
            .bridge_description(node.management_ip, INTEGRATION_BRIDGE)
            .unwrap();
        assert_eq!(description.datapath_id, "0000000000000001");
        assert_eq!(description.fail_mode, FailMode::Secure);
        assert_eq!(
            description.controllers,
            vec![ControllerInfo::tcp(
                IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)),
                6653
            )]
        );
    }

    #[tokio::test]
    async fn test_gateway_gets_router_bridge_patch_and_uplink() {
        let h = harness();
        let node = gateway("gateway-01", 2);
        let ip = node.management_ip;
        h.fabric.connect(ip, 6640).await;
        h.registry.put(node).await.unwrap();

        h.reconciler.bootstrap("gateway-01").await.unwrap();

        assert_eq!(state_of(&h, "gateway-01").await, LifecycleState::Complete);
        let provisioned = h.fabric.provisioning_calls();
        assert!(provisioned.contains(&Call::AddBridge {
            host: ip,
            name: ROUTER_BRIDGE.into()
        }));
        assert!(provisioned.contains(&Call::AddPatchPair {
            host: ip,
            a: PATCH_INTG_BRIDGE.into(),
            b: PATCH_ROUT_BRIDGE.into()
        }));
        assert!(provisioned.contains(&Call::AddPort {
            host: ip,
            bridge: ROUTER_BRIDGE.into(),
            port: "eth1".into()
        }));
    }

    #[tokio::test]
    async fn test_satisfied_stages_issue_no_calls() {
        let h = harness();
        h.fabric.connect(Ipv4Addr::new(10, 0, 0, 2), 6640).await;
        h.registry.put(gateway("gateway-01", 2)).await.unwrap();
        h.reconciler.bootstrap("gateway-01").await.unwrap();
        h.fabric.clear_calls();

        let node = h.registry.get("gateway-01").await.unwrap().unwrap();
        let facts = h.reconciler.facts(&node).await;
        for state in [LifecycleState::Init, LifecycleState::DeviceCreated] {
            let step = h
                .reconciler
                .process(&node.with_state(state), &facts)
                .await
                .unwrap();
            assert_eq!(step, Step::Rederive);
        }
        assert!(h.fabric.provisioning_calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_bridge_capability_keeps_state() {
        let h = harness();
        let node = compute("compute-01", 1);
        h.fabric.connect(node.management_ip, 6640).await;
        h.fabric.set_capabilities(node.management_ip, false, true);
        h.registry.put(node).await.unwrap();

        let err = h.reconciler.bootstrap("compute-01").await.unwrap_err();

        assert!(matches!(err, NodeError::CapabilityMissing { .. }));
        assert_eq!(state_of(&h, "compute-01").await, LifecycleState::Init);
        assert!(h.fabric.provisioning_calls().is_empty());
    }

    #[tokio::test]
    async fn test_force_incomplete_is_idempotent() {
        let h = harness();
        h.registry.put(compute("compute-01", 1)).await.unwrap();

        h.reconciler.force_incomplete("compute-01").await.unwrap();
        h.reconciler.force_incomplete("compute-01").await.unwrap();
        h.reconciler.force_incomplete("missing").await.unwrap();

        assert_eq!(state_of(&h, "compute-01").await, LifecycleState::Incomplete);
    }

    #[tokio::test]
    async fn test_init_node_restarts_from_init() {
        let h = harness();
        let node = compute("compute-01", 1);
        h.fabric.connect(node.management_ip, 6640).await;
        h.registry.put(node).await.unwrap();
        h.reconciler.bootstrap("compute-01").await.unwrap();
        h.fabric.clear_calls();

        h.reconciler.init_node("compute-01").await.unwrap();

        assert_eq!(state_of(&h, "compute-01").await, LifecycleState::Complete);
        assert!(h.fabric.provisioning_calls().is_empty());
        assert!(h.reconciler.init_node("missing").await.is_err());
    }
}
