//! Gateway select groups on compute nodes.
//!
//! Every compute node carries one select group per transport mode it
//! supports, with one bucket per gateway reachable over that mode.  Group
//! identity is a SHA-256 digest of the compute bridge id and the mode, so
//! any member recomputes the same key after a restart and finds the group
//! it installed before.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::device::{
    DeviceService, GroupBucket, GroupDescription, GroupId, GroupKey, GroupService, GroupType,
    Instruction, PortNumber,
};
use crate::error::{NodeError, Result};
use crate::types::{DeviceId, MacAddr, NetworkMode, Node, DEFAULT_TUNNEL};

fn digest(device: &DeviceId, mode: NetworkMode) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(device.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(mode.as_str().as_bytes());
    hasher.finalize().into()
}

/// Key of the group for `(device, mode)`: the first 8 digest bytes in hex.
pub fn group_key(device: &DeviceId, mode: NetworkMode) -> GroupKey {
    GroupKey(hex::encode(&digest(device, mode)[..8]))
}

/// Numeric id of the group for `(device, mode)`, kept non-negative.
pub fn group_id(device: &DeviceId, mode: NetworkMode) -> GroupId {
    let d = digest(device, mode);
    GroupId(u32::from_be_bytes([d[0], d[1], d[2], d[3]]) & 0x7fff_ffff)
}

pub struct GatewaySynchronizer {
    devices: Arc<dyn DeviceService>,
    groups: Arc<dyn GroupService>,
    app_id: String,
}

impl GatewaySynchronizer {
    pub fn new(
        devices: Arc<dyn DeviceService>,
        groups: Arc<dyn GroupService>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            devices,
            groups,
            app_id: app_id.into(),
        }
    }

    /// Installs the gateway groups of `compute`, one per supported mode.
    ///
    /// A group that already exists is brought to exactly the buckets
    /// `gateways` call for, keeping its key and id.
    pub async fn create_gateway_group(&self, compute: &Node, gateways: &[Node]) -> Result<()> {
        let device = &compute.integration_bridge;
        for mode in compute.network_modes() {
            let buckets = self.buckets(compute, gateways, mode).await?;
            let key = group_key(device, mode);

            if let Some(group) = self.groups.get_group(device, &key).await {
                debug!("Gateway group {} on {} exists, resyncing", group.id, device);
                self.remove_stale(device, &key, group.buckets.clone(), &buckets)
                    .await?;
                self.add_missing(device, &key, &group.buckets, &buckets)
                    .await?;
                continue;
            }

            let id = group_id(device, mode);
            info!(
                "Installing {} gateway group {} on {} with {} buckets",
                mode,
                id,
                device,
                buckets.len()
            );
            self.groups
                .add_group(GroupDescription {
                    device: device.clone(),
                    group_type: GroupType::Select,
                    buckets,
                    key,
                    id,
                    app_id: self.app_id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Adds (`insert`) or removes the bucket delta between the group and
    /// the buckets `gateways` call for.  The group itself is kept.
    pub async fn update_gateway_group_buckets(
        &self,
        compute: &Node,
        gateways: &[Node],
        mode: NetworkMode,
        insert: bool,
    ) -> Result<()> {
        let device = &compute.integration_bridge;
        let key = group_key(device, mode);
        let Some(group) = self.groups.get_group(device, &key).await else {
            return Err(NodeError::GroupNotFound {
                device: device.clone(),
                mode,
            });
        };

        let desired = self.buckets(compute, gateways, mode).await?;
        if insert {
            self.add_missing(device, &key, &group.buckets, &desired)
                .await
        } else {
            self.remove_stale(device, &key, group.buckets, &desired)
                .await
        }
    }

    async fn add_missing(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        current: &[GroupBucket],
        desired: &[GroupBucket],
    ) -> Result<()> {
        let mut seen: HashSet<&GroupBucket> = current.iter().collect();
        let added: Vec<_> = desired
            .iter()
            .filter(|b| seen.insert(*b))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(());
        }
        self.groups
            .add_buckets_to_group(device, key, added, &self.app_id)
            .await
    }

    async fn remove_stale(
        &self,
        device: &DeviceId,
        key: &GroupKey,
        current: Vec<GroupBucket>,
        desired: &[GroupBucket],
    ) -> Result<()> {
        let desired: HashSet<&GroupBucket> = desired.iter().collect();
        let removed: Vec<_> = current
            .into_iter()
            .filter(|b| !desired.contains(b))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        self.groups
            .remove_buckets_from_group(device, key, removed, &self.app_id)
            .await
    }

    /// One bucket per gateway usable over `mode`.  Gateways lacking what
    /// the mode needs are skipped.
    pub async fn buckets(
        &self,
        compute: &Node,
        gateways: &[Node],
        mode: NetworkMode,
    ) -> Result<Vec<GroupBucket>> {
        match mode {
            NetworkMode::Tunnel => {
                let out = self.local_port(compute, DEFAULT_TUNNEL).await?;
                Ok(gateways
                    .iter()
                    .filter_map(|gw| match gw.data_ip {
                        Some(ip) => Some(GroupBucket {
                            instructions: vec![
                                Instruction::SetTunnelDst(ip),
                                Instruction::Output(out),
                            ],
                        }),
                        None => {
                            warn!("Gateway {} has no data address, skipping", gw.hostname);
                            None
                        }
                    })
                    .collect())
            }
            NetworkMode::Vlan => {
                let vlan = compute.vlan_intf.as_deref().ok_or_else(|| NodeError::Device {
                    device: compute.integration_bridge.clone(),
                    reason: format!("{} has no VLAN port", compute.hostname),
                })?;
                let out = self.local_port(compute, vlan).await?;
                let macs = join_all(gateways.iter().map(|gw| self.vlan_mac(gw))).await;
                Ok(gateways
                    .iter()
                    .zip(macs)
                    .filter_map(|(gw, mac)| match mac {
                        Some(mac) => Some(GroupBucket {
                            instructions: vec![
                                Instruction::SetEthDst(mac),
                                Instruction::Output(out),
                            ],
                        }),
                        None => {
                            warn!("Gateway {} has no VLAN port MAC, skipping", gw.hostname);
                            None
                        }
                    })
                    .collect())
            }
        }
    }

    async fn local_port(&self, compute: &Node, name: &str) -> Result<PortNumber> {
        self.devices
            .port(&compute.integration_bridge, name)
            .await
            .map(|p| p.number)
            .ok_or_else(|| NodeError::Device {
                device: compute.integration_bridge.clone(),
                reason: format!("no {} port", name),
            })
    }

    async fn vlan_mac(&self, gateway: &Node) -> Option<MacAddr> {
        let vlan = gateway.vlan_intf.as_deref()?;
        self.devices
            .port(&gateway.integration_bridge, vlan)
            .await
            .map(|p| p.mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::device::SimulatedFabric;
    use crate::types::fixtures::{compute, gateway};
    use crate::types::INTEGRATION_BRIDGE;

    fn provisioned(fabric: &SimulatedFabric, node: &Node, ports: &[&str]) {
        fabric.install_bridge(
            node.management_ip,
            INTEGRATION_BRIDGE,
            node.integration_bridge.clone(),
        );
        for port in ports {
            fabric
                .install_port(node.management_ip, INTEGRATION_BRIDGE, port)
                .unwrap();
        }
    }

    fn synchronizer(fabric: &SimulatedFabric) -> GatewaySynchronizer {
        GatewaySynchronizer::new(
            Arc::new(fabric.clone()),
            Arc::new(fabric.clone()),
            "org.fabric.node",
        )
    }

    #[test]
    fn test_group_identity_is_stable() {
        let bridge = DeviceId::new("of:0000000000000001");
        assert_eq!(
            group_key(&bridge, NetworkMode::Tunnel),
            group_key(&bridge.clone(), NetworkMode::Tunnel)
        );
        assert_ne!(
            group_key(&bridge, NetworkMode::Tunnel),
            group_key(&bridge, NetworkMode::Vlan)
        );
        assert_eq!(group_key(&bridge, NetworkMode::Tunnel).0.len(), 16);
        assert!(group_id(&bridge, NetworkMode::Vlan).0 <= 0x7fff_ffff);
    }

    #[tokio::test]
    async fn test_buckets_follow_gateway_membership() {
        let fabric = SimulatedFabric::new();
        let c = compute("compute-01", 1);
        let (gw1, gw2) = (gateway("gateway-01", 2), gateway("gateway-02", 3));
        provisioned(&fabric, &c, &["vxlan"]);
        let sync = synchronizer(&fabric);

        sync.create_gateway_group(&c, &[gw1.clone(), gw2.clone()])
            .await
            .unwrap();
        let before = fabric.groups();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].buckets.len(), 2);
        assert!(before[0].buckets[0]
            .instructions
            .contains(&Instruction::SetTunnelDst(Ipv4Addr::new(192, 168, 0, 2))));

        sync.update_gateway_group_buckets(&c, &[gw1], NetworkMode::Tunnel, false)
            .await
            .unwrap();
        let after = fabric.groups();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].buckets.len(), 1);
        assert_eq!(after[0].key, before[0].key);
        assert_eq!(after[0].id, before[0].id);
    }

    #[tokio::test]
    async fn test_missing_group_is_reported() {
        let fabric = SimulatedFabric::new();
        let c = compute("compute-01", 1);
        provisioned(&fabric, &c, &["vxlan"]);

        let err = synchronizer(&fabric)
            .update_gateway_group_buckets(&c, &[], NetworkMode::Tunnel, true)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_vlan_gateway_without_port_is_skipped() {
        let fabric = SimulatedFabric::new();
        let mut c = compute("compute-01", 1);
        c.data_ip = None;
        c.vlan_intf = Some("eth2".into());
        provisioned(&fabric, &c, &["eth2"]);

        let mut with_vlan = gateway("gateway-01", 2);
        with_vlan.vlan_intf = Some("eth2".into());
        provisioned(&fabric, &with_vlan, &["eth2"]);
        let without_vlan = gateway("gateway-02", 3);

        let buckets = synchronizer(&fabric)
            .buckets(&c, &[with_vlan, without_vlan], NetworkMode::Vlan)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(matches!(buckets[0].instructions[0], Instruction::SetEthDst(_)));
    }
}
