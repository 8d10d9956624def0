//! Node registry.
//!
//! The registry is the single source of truth for which nodes exist and
//! what they declare.  Every mutation fires exactly one [`RegistryEvent`]
//! to every registered listener, in mutation order.
//!
//! Values are stored as versioned records (see [`NodeRecord`]) so that a
//! replicated backend can refuse data written by an incompatible schema
//! instead of misreading it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::types::{ListenerId, Node};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// A change observed in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Inserted(Node),
    Updated { old: Node, new: Node },
    Removed(Node),
}

/// Callback invoked for every registry change.
///
/// Listeners run inside the registry's serialization point and must not
/// call back into the registry.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Inserts or replaces the node stored under its hostname.
    async fn put(&self, node: Node) -> Result<()>;

    /// Removes a node, returning what was stored.
    async fn remove(&self, hostname: &str) -> Result<Option<Node>>;

    async fn get(&self, hostname: &str) -> Result<Option<Node>>;

    async fn list(&self) -> Result<Vec<Node>>;

    fn add_listener(&self, listener: RegistryListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// On-the-wire form of a registry value.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub version: u32,
    pub node: Node,
}

impl NodeRecord {
    pub fn encode(node: &Node) -> Result<Vec<u8>> {
        let record = NodeRecordRef {
            version: SCHEMA_VERSION,
            node,
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Node> {
        let record: NodeRecord = serde_json::from_slice(bytes)?;
        if record.version != SCHEMA_VERSION {
            return Err(NodeError::Registry(format!(
                "unsupported node record version {} (expected {})",
                record.version, SCHEMA_VERSION
            )));
        }
        Ok(record.node)
    }
}

#[derive(Serialize)]
struct NodeRecordRef<'a> {
    version: u32,
    node: &'a Node,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    listeners: Vec<(ListenerId, RegistryListener)>,
    next_listener: u64,
}

impl Inner {
    fn notify(&self, event: RegistryEvent) {
        for (_, listener) in &self.listeners {
            listener(&event);
        }
    }
}

/// In-process registry.
///
/// A single lock orders all mutations, so every replica sharing one
/// instance observes the same sequence of events.
#[derive(Clone, Default)]
pub struct MemoryNodeRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| NodeError::Registry("registry lock poisoned".into()))
    }

    /// Stores a raw record, bypassing the encoder.
    #[cfg(test)]
    fn put_raw(&self, hostname: &str, bytes: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .entries
            .insert(hostname.to_string(), bytes);
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn put(&self, node: Node) -> Result<()> {
        let bytes = NodeRecord::encode(&node)?;
        let mut inner = self.lock()?;
        // Decode before inserting so a rejected record leaves the store as is.
        let old = inner
            .entries
            .get(&node.hostname)
            .map(|old| NodeRecord::decode(old))
            .transpose()?;
        inner.entries.insert(node.hostname.clone(), bytes);
        debug!("Stored node {} ({})", node.hostname, node.state);
        let event = match old {
            Some(old) => RegistryEvent::Updated { old, new: node },
            None => RegistryEvent::Inserted(node),
        };
        inner.notify(event);
        Ok(())
    }

    async fn remove(&self, hostname: &str) -> Result<Option<Node>> {
        let mut inner = self.lock()?;
        let removed = match inner.entries.remove(hostname) {
            Some(bytes) => NodeRecord::decode(&bytes)?,
            None => return Ok(None),
        };
        debug!("Removed node {}", hostname);
        inner.notify(RegistryEvent::Removed(removed.clone()));
        Ok(Some(removed))
    }

    async fn get(&self, hostname: &str) -> Result<Option<Node>> {
        let inner = self.lock()?;
        inner
            .entries
            .get(hostname)
            .map(|bytes| NodeRecord::decode(bytes))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let inner = self.lock()?;
        inner
            .entries
            .values()
            .map(|bytes| NodeRecord::decode(bytes))
            .collect()
    }

    fn add_listener(&self, listener: RegistryListener) -> ListenerId {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.listeners.retain(|(lid, _)| *lid != id);
    }
}
