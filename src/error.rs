//! Errors raised while reconciling nodes.
//!
//! None of these ever stop the controller: the worker logs each one and
//! moves on to the next event.

use thiserror::Error;

use crate::types::{DeviceId, NetworkMode};

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The management endpoint of a node is unreachable.
    #[error("management endpoint of {hostname} is not connected")]
    Connectivity { hostname: String },

    /// A device does not expose a capability the controller needs.
    #[error("device {device} does not support {capability}")]
    CapabilityMissing {
        device: DeviceId,
        capability: &'static str,
    },

    /// A declared node entry could not be parsed.
    #[error("invalid node entry #{index}: {reason}")]
    ConfigParse { index: usize, reason: String },

    /// A declared node violates a role invariant.
    #[error("invalid node {hostname}: {reason}")]
    InvalidNode { hostname: String, reason: String },

    /// A device event refers to a device no registered node owns.
    #[error("no node owns device {0}")]
    UnknownDevice(DeviceId),

    /// A bucket update targeted a group that was never installed.
    #[error("no {mode} gateway group on {device}")]
    GroupNotFound { device: DeviceId, mode: NetworkMode },

    /// A device accepted a request but failed to carry it out.
    #[error("device {device} failed: {reason}")]
    Device { device: DeviceId, reason: String },

    /// The node registry rejected an operation or held an unreadable record.
    #[error("registry error: {0}")]
    Registry(String),
}

impl NodeError {
    /// Level at which the worker reports this error.
    pub fn level(&self) -> log::Level {
        match self {
            NodeError::UnknownDevice(_) | NodeError::Connectivity { .. } => log::Level::Debug,
            NodeError::ConfigParse { .. } | NodeError::InvalidNode { .. } => log::Level::Warn,
            _ => log::Level::Error,
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Registry(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_devices_stay_quiet() {
        let err = NodeError::UnknownDevice(DeviceId::new("of:00000000000000ff"));
        assert_eq!(err.level(), log::Level::Debug);
        let err = NodeError::Connectivity {
            hostname: "compute-01".into(),
        };
        assert_eq!(err.level(), log::Level::Debug);
        let err = NodeError::CapabilityMissing {
            device: DeviceId::new("ovsdb:10.0.0.1"),
            capability: "bridge configuration",
        };
        assert_eq!(err.level(), log::Level::Error);
        assert_eq!(
            err.to_string(),
            "device ovsdb:10.0.0.1 does not support bridge configuration"
        );
    }
}
