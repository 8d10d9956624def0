//! Declared node set.
//!
//! Parses node entries and reconciles the registry with them: new hosts
//! are inserted at `INIT`, changed hosts keep their state, and hosts that
//! disappeared are marked `INCOMPLETE`, deleted and disconnected.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::device::OvsdbController;
use crate::error::{NodeError, Result};
use crate::registry::NodeRegistry;
use crate::types::{
    ControllerInfo, DeviceId, GatewayAttrs, LifecycleState, MacAddr, Node, NodeType,
};

/// One declared host as it appears in the node set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEntry {
    hostname: String,
    management_ip: Ipv4Addr,
    management_port: Option<u16>,
    bridge_id: String,
    node_type: NodeType,
    uplink_interface_name: Option<String>,
    uplink_interface_mac: Option<MacAddr>,
    router_bridge_id: Option<String>,
    router_controllers: Option<Vec<SocketAddr>>,
    data_ip: Option<Ipv4Addr>,
    vlan_intf: Option<String>,
}

/// Parses the entry at `index`.  The node comes back at `INIT`.
pub fn parse_entry(index: usize, value: &Value, default_port: u16) -> Result<Node> {
    let fail = |reason: String| NodeError::ConfigParse { index, reason };

    let entry = NodeEntry::deserialize(value).map_err(|e| fail(e.to_string()))?;
    let integration_bridge = DeviceId::bridge(&entry.bridge_id).map_err(fail)?;

    let gateway = match entry.node_type {
        NodeType::Compute => None,
        NodeType::Gateway => {
            let router_bridge = entry
                .router_bridge_id
                .as_deref()
                .ok_or_else(|| fail("gateway entry lacks routerBridgeId".into()))
                .and_then(|id| DeviceId::bridge(id).map_err(fail))?;
            let uplink_port = entry
                .uplink_interface_name
                .ok_or_else(|| fail("gateway entry lacks uplinkInterfaceName".into()))?;
            let external_mac = entry
                .uplink_interface_mac
                .ok_or_else(|| fail("gateway entry lacks uplinkInterfaceMac".into()))?;
            let router_controllers = entry.router_controllers.map(|addrs| {
                addrs
                    .into_iter()
                    .map(|addr| ControllerInfo::tcp(addr.ip(), addr.port()))
                    .collect()
            });
            Some(GatewayAttrs {
                router_bridge,
                uplink_port,
                external_mac,
                router_controllers,
            })
        }
    };

    let node = Node {
        hostname: entry.hostname,
        node_type: entry.node_type,
        management_ip: entry.management_ip,
        management_port: entry.management_port.unwrap_or(default_port),
        integration_bridge,
        gateway,
        data_ip: entry.data_ip,
        vlan_intf: entry.vlan_intf,
        state: LifecycleState::Init,
    };
    node.validate()?;
    Ok(node)
}

/// Parses every entry, skipping malformed ones and repeated hostnames.
pub fn parse_entries(entries: &[Value], default_port: u16) -> Vec<Node> {
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::with_capacity(entries.len());
    for (index, value) in entries.iter().enumerate() {
        match parse_entry(index, value, default_port) {
            Ok(node) if !seen.insert(node.hostname.clone()) => {
                warn!("Skipping entry #{}: duplicate hostname {}", index, node.hostname);
            }
            Ok(node) => nodes.push(node),
            Err(e) => warn!("Skipping node entry: {}", e),
        }
    }
    nodes
}

pub struct ConfigWatcher {
    registry: Arc<dyn NodeRegistry>,
    ovsdb: Arc<dyn OvsdbController>,
    default_port: u16,
}

impl ConfigWatcher {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        ovsdb: Arc<dyn OvsdbController>,
        default_port: u16,
    ) -> Self {
        Self {
            registry,
            ovsdb,
            default_port,
        }
    }

    /// Brings the registry in line with `entries`.
    pub async fn apply(&self, entries: &[Value]) -> Result<()> {
        let declared = parse_entries(entries, self.default_port);
        let mut existing: BTreeMap<String, Node> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|node| (node.hostname.clone(), node))
            .collect();

        for node in declared {
            match existing.remove(&node.hostname) {
                None => {
                    info!("Adding node {} ({:?})", node.hostname, node.node_type);
                    self.registry.put(node).await?;
                }
                Some(old) if !old.same_declaration(&node) => {
                    info!("Updating node {}", node.hostname);
                    self.registry.put(node.with_state(old.state)).await?;
                }
                Some(_) => {}
            }
        }

        for (_, node) in existing {
            self.retire(node).await?;
        }
        Ok(())
    }

    async fn retire(&self, node: Node) -> Result<()> {
        info!("Removing node {}", node.hostname);
        if node.state != LifecycleState::Incomplete {
            self.registry
                .put(node.with_state(LifecycleState::Incomplete))
                .await?;
        }
        self.registry.remove(&node.hostname).await?;
        if self
            .ovsdb
            .is_connected(node.management_ip, node.management_port)
            .await
        {
            self.ovsdb
                .disconnect(node.management_ip, node.management_port)
                .await;
        }
        Ok(())
    }
}
