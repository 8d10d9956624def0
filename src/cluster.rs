//! Cluster membership and leadership.
//!
//! Exactly one member drives reconciliation for an application identity:
//! the elected leader.  [`LeaderGate`] asks the leadership service on
//! every event, never caching the answer, because leadership can move
//! between two events.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Identity of a controller process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait ClusterService: Send + Sync {
    fn local_member_id(&self) -> MemberId;

    /// Addresses of every cluster member, programmed as bridge controllers.
    fn member_addresses(&self) -> Vec<IpAddr>;
}

pub trait LeadershipService: Send + Sync {
    fn run_for_leadership(&self, app_id: &str);

    fn leader(&self, app_id: &str) -> Option<MemberId>;

    fn withdraw(&self, app_id: &str);
}

#[derive(Default)]
struct ClusterState {
    members: Vec<(MemberId, IpAddr)>,
    /// Candidates per application, in the order they ran.  The first one
    /// is the leader.
    candidates: HashMap<String, Vec<MemberId>>,
}

/// In-process cluster shared by every member handle cloned from it.
#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
    local: MemberId,
}

impl LocalCluster {
    /// Creates a cluster holding a single member.
    pub fn new(local: MemberId, ip: IpAddr) -> Self {
        let state = ClusterState {
            members: vec![(local.clone(), ip)],
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            local,
        }
    }

    /// Adds a member to the same cluster and returns its view.
    pub fn join(&self, member: MemberId, ip: IpAddr) -> LocalCluster {
        self.with_state(|state| {
            if !state.members.iter().any(|(id, _)| *id == member) {
                state.members.push((member.clone(), ip));
            }
        });
        LocalCluster {
            state: Arc::clone(&self.state),
            local: member,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }
}

impl ClusterService for LocalCluster {
    fn local_member_id(&self) -> MemberId {
        self.local.clone()
    }

    fn member_addresses(&self) -> Vec<IpAddr> {
        self.with_state(|state| state.members.iter().map(|(_, ip)| *ip).collect())
    }
}

impl LeadershipService for LocalCluster {
    fn run_for_leadership(&self, app_id: &str) {
        let local = self.local.clone();
        self.with_state(|state| {
            let candidates = state.candidates.entry(app_id.to_string()).or_default();
            if !candidates.contains(&local) {
                candidates.push(local);
            }
        });
    }

    fn leader(&self, app_id: &str) -> Option<MemberId> {
        self.with_state(|state| {
            state
                .candidates
                .get(app_id)
                .and_then(|candidates| candidates.first().cloned())
        })
    }

    fn withdraw(&self, app_id: &str) {
        let local = self.local.clone();
        self.with_state(|state| {
            if let Some(candidates) = state.candidates.get_mut(app_id) {
                candidates.retain(|id| *id != local);
            }
        });
        info!("{} withdrew from leadership of {}", self.local, app_id);
    }
}

/// Admits events only while the local member leads `app_id`.
#[derive(Clone)]
pub struct LeaderGate {
    leadership: Arc<dyn LeadershipService>,
    local: MemberId,
    app_id: String,
}

impl LeaderGate {
    pub fn new(leadership: Arc<dyn LeadershipService>, local: MemberId, app_id: String) -> Self {
        Self {
            leadership,
            local,
            app_id,
        }
    }

    pub fn is_leader(&self) -> bool {
        let leader = self.leadership.leader(&self.app_id);
        if leader.as_ref() == Some(&self.local) {
            return true;
        }
        debug!(
            "Dropping event on {}: leader of {} is {:?}",
            self.local, self.app_id, leader
        );
        false
    }
}
