//! Shared setup for the controller integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};

use serde_json::{json, Value};
use tokio::sync::broadcast::Receiver;

use fabric_node::cluster::{LocalCluster, MemberId};
use fabric_node::device::SimulatedFabric;
use fabric_node::registry::MemoryNodeRegistry;
use fabric_node::{
    ControllerHandle, ControllerSettings, LifecycleEvent, LifecycleState, NodeController,
    Services,
};

pub const APP: &str = "org.fabric.node";

pub fn mgmt_ip(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, n)
}

pub fn member_ip(n: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(172, 16, 0, n))
}

pub fn compute_entry(hostname: &str, n: u8) -> Value {
    json!({
        "hostname": hostname,
        "managementIp": mgmt_ip(n).to_string(),
        "managementPort": 6640,
        "bridgeId": format!("of:00000000000000{:02x}", n),
        "nodeType": "COMPUTE",
        "dataIp": format!("192.168.0.{}", n),
    })
}

pub fn gateway_entry(hostname: &str, n: u8) -> Value {
    json!({
        "hostname": hostname,
        "managementIp": mgmt_ip(n).to_string(),
        "managementPort": 6640,
        "bridgeId": format!("of:00000000000000{:02x}", n),
        "nodeType": "GATEWAY",
        "routerBridgeId": format!("of:00000000000001{:02x}", n),
        "uplinkInterfaceName": "eth1",
        "uplinkInterfaceMac": format!("02:00:00:00:01:{:02x}", n),
        "dataIp": format!("192.168.0.{}", n),
    })
}

/// A registry, cluster and fabric that several controllers can share.
pub struct Harness {
    pub registry: MemoryNodeRegistry,
    pub fabric: SimulatedFabric,
    pub cluster: LocalCluster,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            registry: MemoryNodeRegistry::new(),
            fabric: SimulatedFabric::new(),
            cluster: LocalCluster::new(MemberId::new("a"), member_ip(1)),
        }
    }

    pub fn start(&self) -> ControllerHandle {
        self.start_member(&self.cluster)
    }

    pub fn start_member(&self, cluster: &LocalCluster) -> ControllerHandle {
        let services = Services::simulated(
            self.registry.clone(),
            cluster.clone(),
            self.fabric.clone(),
        );
        NodeController::start(ControllerSettings::default(), services)
    }
}

pub fn drain(rx: &mut Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn states_of(events: &[LifecycleEvent], hostname: &str) -> Vec<LifecycleState> {
    events
        .iter()
        .filter(|e| e.node.hostname == hostname)
        .map(|e| e.state)
        .collect()
}
