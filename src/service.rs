//! Read-only queries over registered nodes.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::device::{DeviceService, GroupId, PortNumber};
use crate::error::Result;
use crate::gateway::group_id;
use crate::registry::NodeRegistry;
use crate::types::{DeviceId, LifecycleState, NetworkMode, Node, NodeType, DEFAULT_TUNNEL};

#[derive(Clone)]
pub struct NodeService {
    registry: Arc<dyn NodeRegistry>,
    devices: Arc<dyn DeviceService>,
}

impl NodeService {
    pub fn new(registry: Arc<dyn NodeRegistry>, devices: Arc<dyn DeviceService>) -> Self {
        Self { registry, devices }
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.registry.list().await
    }

    pub async fn node(&self, hostname: &str) -> Result<Option<Node>> {
        self.registry.get(hostname).await
    }

    pub async fn nodes_of_type(&self, node_type: NodeType) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.node_type == node_type)
            .collect())
    }

    /// Every node in `COMPLETE`, regardless of type.
    pub async fn list_complete_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.state == LifecycleState::Complete)
            .collect())
    }

    pub async fn complete_nodes(&self, node_type: NodeType) -> Result<Vec<Node>> {
        Ok(self
            .list_complete_nodes()
            .await?
            .into_iter()
            .filter(|n| n.node_type == node_type)
            .collect())
    }

    async fn owner_of(&self, bridge: &DeviceId) -> Result<Option<Node>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.owns_bridge(bridge)))
    }

    /// Tunnel address of the node owning `bridge`.
    pub async fn data_address_of(&self, bridge: &DeviceId) -> Result<Option<Ipv4Addr>> {
        Ok(self.owner_of(bridge).await?.and_then(|n| n.data_ip))
    }

    /// Port number of the tunnel interface on the integration bridge of
    /// the node owning `bridge`.
    pub async fn tunnel_port_of(&self, bridge: &DeviceId) -> Result<Option<PortNumber>> {
        let Some(node) = self.owner_of(bridge).await? else {
            return Ok(None);
        };
        Ok(self
            .devices
            .port(&node.integration_bridge, DEFAULT_TUNNEL)
            .await
            .map(|p| p.number))
    }

    pub async fn router_bridge_of(&self, bridge: &DeviceId) -> Result<Option<DeviceId>> {
        Ok(self
            .owner_of(bridge)
            .await?
            .and_then(|n| n.router_bridge().cloned()))
    }

    /// Port number of the gateway uplink on its router bridge.
    pub async fn external_port_of(&self, bridge: &DeviceId) -> Result<Option<PortNumber>> {
        let Some(node) = self.owner_of(bridge).await? else {
            return Ok(None);
        };
        let (Some(router), Some(uplink)) = (node.router_bridge(), node.uplink_port()) else {
            return Ok(None);
        };
        Ok(self.devices.port(router, uplink).await.map(|p| p.number))
    }

    /// Id of the gateway group for `mode` on the node owning `bridge`, if
    /// that node supports the mode.
    pub async fn gateway_group_id(
        &self,
        bridge: &DeviceId,
        mode: NetworkMode,
    ) -> Result<Option<GroupId>> {
        Ok(self
            .owner_of(bridge)
            .await?
            .filter(|n| n.supports(mode))
            .map(|n| group_id(&n.integration_bridge, mode)))
    }
}
