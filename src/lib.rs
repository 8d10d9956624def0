//! Node lifecycle controller for compute and gateway hosts.
//!
//! Drives each declared host's bridges and interfaces towards `COMPLETE`
//! and keeps the gateway select groups on compute nodes in step with the
//! set of complete gateways.  See [`controller::NodeController`].

pub mod cluster;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod gateway;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod service;
pub mod state;
pub mod types;
pub mod watcher;

pub use controller::{ControllerHandle, ControllerSettings, NodeController, Services};
pub use error::{NodeError, Result};
pub use types::{LifecycleEvent, LifecycleState, Node, NodeType};
