//! The node controller.
//!
//! All work happens on one worker task that drains a single queue.  The
//! registry and device listeners only enqueue, so a slow device call never
//! stalls whoever delivered the event.  Lifecycle events are broadcast
//! straight from the registry listener, on every member, in mutation
//! order.  Everything else passes the [`LeaderGate`] first.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, log};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cluster::{ClusterService, LeaderGate, LeadershipService, LocalCluster};
use crate::config::{self, Config};
use crate::device::{
    DeviceEvent, DeviceService, DriverService, GroupService, OvsdbController, SimulatedFabric,
};
use crate::error::Result;
use crate::gateway::GatewaySynchronizer;
use crate::reconciler::Reconciler;
use crate::registry::{MemoryNodeRegistry, NodeRegistry, RegistryEvent};
use crate::router::{DeviceEventRouter, Route};
use crate::service::NodeService;
use crate::types::{LifecycleEvent, LifecycleState, ListenerId, Node, NodeType};
use crate::watcher::ConfigWatcher;

const LIFECYCLE_CAPACITY: usize = 1024;

/// Every collaborator the controller talks to.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<dyn NodeRegistry>,
    pub cluster: Arc<dyn ClusterService>,
    pub leadership: Arc<dyn LeadershipService>,
    pub devices: Arc<dyn DeviceService>,
    pub ovsdb: Arc<dyn OvsdbController>,
    pub drivers: Arc<dyn DriverService>,
    pub groups: Arc<dyn GroupService>,
}

impl Services {
    /// Wires the in-process registry and cluster to a simulated fabric.
    pub fn simulated(
        registry: MemoryNodeRegistry,
        cluster: LocalCluster,
        fabric: SimulatedFabric,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            cluster: Arc::new(cluster.clone()),
            leadership: Arc::new(cluster),
            devices: Arc::new(fabric.clone()),
            ovsdb: Arc::new(fabric.clone()),
            drivers: Arc::new(fabric.clone()),
            groups: Arc::new(fabric),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub app_id: String,
    pub ovsdb_port: u16,
    pub openflow_port: u16,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings::from(&Config::default())
    }
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            app_id: config.app_id.clone(),
            ovsdb_port: config.ovsdb_port,
            openflow_port: config.openflow_port,
        }
    }
}

#[derive(Debug)]
pub enum ControllerEvent {
    Registry(RegistryEvent),
    Device(DeviceEvent),
    Config(Vec<Value>),
    InitNode(String),
    /// Answered once no other work is queued.
    Flush(oneshot::Sender<()>),
}

impl ControllerEvent {
    fn is_work(&self) -> bool {
        !matches!(self, ControllerEvent::Flush(_))
    }
}

/// The lifecycle event a registry change implies, if any.
pub fn lifecycle_event(event: &RegistryEvent) -> Option<LifecycleEvent> {
    match event {
        RegistryEvent::Inserted(node) => Some(LifecycleEvent {
            state: node.state,
            node: node.clone(),
        }),
        RegistryEvent::Updated { old, new } if old.state != new.state => Some(LifecycleEvent {
            state: new.state,
            node: new.clone(),
        }),
        _ => None,
    }
}

/// The worker's inbox.  `pending` counts queued work and leaves flushes
/// out, so any number of flushes can wait on it at once.
#[derive(Clone)]
struct EventQueue {
    tx: mpsc::UnboundedSender<ControllerEvent>,
    pending: Arc<AtomicUsize>,
}

impl EventQueue {
    fn push(&self, event: ControllerEvent) {
        let work = event.is_work();
        if work {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        if self.tx.send(event).is_err() {
            if work {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Controller stopped, dropping event");
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn done(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    gate: LeaderGate,
    reconciler: Reconciler,
    router: DeviceEventRouter,
    watcher: ConfigWatcher,
    gateways: GatewaySynchronizer,
    nodes: NodeService,
    queue: EventQueue,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        while let Some(event) = rx.recv().await {
            let work = event.is_work();
            self.handle(event).await;
            if work {
                self.queue.done();
            }
        }
    }

    async fn handle(&self, event: ControllerEvent) {
        let result = match event {
            ControllerEvent::Flush(reply) => {
                if self.queue.pending() > 0 {
                    self.queue.push(ControllerEvent::Flush(reply));
                } else {
                    let _ = reply.send(());
                }
                Ok(())
            }
            _ if !self.gate.is_leader() => Ok(()),
            ControllerEvent::Registry(event) => self.on_registry(event).await,
            ControllerEvent::Device(event) => self.on_device(event).await,
            ControllerEvent::Config(entries) => self.watcher.apply(&entries).await,
            ControllerEvent::InitNode(hostname) => self.reconciler.init_node(&hostname).await,
        };
        if let Err(e) = result {
            log!(e.level(), "Event handling failed: {}", e);
        }
    }

    async fn on_registry(&self, event: RegistryEvent) -> Result<()> {
        match event {
            RegistryEvent::Inserted(node) => self.reconciler.bootstrap(&node.hostname).await,
            RegistryEvent::Updated { old, new } => {
                if old.state != new.state {
                    if let Err(e) = self.sync_gateways(old.state, &new).await {
                        log!(e.level(), "Gateway group sync for {} failed: {}", new.hostname, e);
                    }
                }
                if old.same_declaration(&new) {
                    return Ok(());
                }
                self.reconciler.bootstrap(&new.hostname).await
            }
            RegistryEvent::Removed(node) => {
                self.sync_gateways(node.state, &node.with_state(LifecycleState::Incomplete))
                    .await
            }
        }
    }

    async fn on_device(&self, event: DeviceEvent) -> Result<()> {
        match self.router.route(&event).await? {
            Route::Bootstrap(hostname) => self.reconciler.bootstrap(&hostname).await,
            Route::ForceIncomplete(hostname) => self.reconciler.force_incomplete(&hostname).await,
            Route::Ignore => Ok(()),
        }
    }

    /// Keeps gateway groups in step with a node entering or leaving
    /// `COMPLETE`.
    async fn sync_gateways(&self, old: LifecycleState, node: &Node) -> Result<()> {
        let entered = old != LifecycleState::Complete && node.state == LifecycleState::Complete;
        let left = old == LifecycleState::Complete && node.state != LifecycleState::Complete;
        if !entered && !left {
            return Ok(());
        }

        let gateways = self.nodes.complete_nodes(NodeType::Gateway).await?;
        match node.node_type {
            NodeType::Compute if entered => {
                self.gateways.create_gateway_group(node, &gateways).await
            }
            NodeType::Compute => Ok(()),
            NodeType::Gateway => {
                for compute in self.nodes.complete_nodes(NodeType::Compute).await? {
                    for mode in compute.network_modes() {
                        if let Err(e) = self
                            .gateways
                            .update_gateway_group_buckets(&compute, &gateways, mode, entered)
                            .await
                        {
                            log!(
                                e.level(),
                                "Gateway group update on {} failed: {}",
                                compute.hostname,
                                e
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

pub struct NodeController;

impl NodeController {
    /// Runs for leadership, registers the listeners and spawns the worker.
    /// Must be called from within a tokio runtime.
    pub fn start(settings: ControllerSettings, services: Services) -> ControllerHandle {
        let local = services.cluster.local_member_id();
        services.leadership.run_for_leadership(&settings.app_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = EventQueue {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        let registry_listener = {
            let queue = queue.clone();
            let lifecycle = lifecycle.clone();
            services
                .registry
                .add_listener(Arc::new(move |event: &RegistryEvent| {
                    if let Some(e) = lifecycle_event(event) {
                        // No subscribers is fine.
                        let _ = lifecycle.send(e);
                    }
                    queue.push(ControllerEvent::Registry(event.clone()));
                }))
        };
        let device_listener = {
            let queue = queue.clone();
            services
                .devices
                .add_listener(Arc::new(move |event: &DeviceEvent| {
                    queue.push(ControllerEvent::Device(event.clone()));
                }))
        };

        let nodes = NodeService::new(services.registry.clone(), services.devices.clone());
        let worker = Worker {
            gate: LeaderGate::new(
                services.leadership.clone(),
                local.clone(),
                settings.app_id.clone(),
            ),
            reconciler: Reconciler::new(services.clone(), settings.openflow_port),
            router: DeviceEventRouter::new(services.registry.clone(), services.devices.clone()),
            watcher: ConfigWatcher::new(
                services.registry.clone(),
                services.ovsdb.clone(),
                settings.ovsdb_port,
            ),
            gateways: GatewaySynchronizer::new(
                services.devices.clone(),
                services.groups.clone(),
                settings.app_id.clone(),
            ),
            nodes: nodes.clone(),
            queue: queue.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        info!("Node controller started on {} for {}", local, settings.app_id);
        ControllerHandle {
            queue,
            lifecycle,
            services,
            nodes,
            app_id: settings.app_id,
            registry_listener,
            device_listener,
            task,
        }
    }
}

/// Entry points into a running controller.
pub struct ControllerHandle {
    queue: EventQueue,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    services: Services,
    nodes: NodeService,
    app_id: String,
    registry_listener: ListenerId,
    device_listener: ListenerId,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Replaces the declared node set.
    pub fn reload_config(&self, entries: Vec<Value>) {
        self.queue.push(ControllerEvent::Config(entries));
    }

    pub fn reload_from_file(&self, path: &Path) -> anyhow::Result<()> {
        let entries = config::load_node_set(path)?;
        info!("Loaded {} node entries from {}", entries.len(), path.display());
        self.reload_config(entries);
        Ok(())
    }

    /// Forces `hostname` back to `INIT` and provisions it again.
    pub fn init_node(&self, hostname: &str) {
        self.queue.push(ControllerEvent::InitNode(hostname.to_string()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn nodes(&self) -> &NodeService {
        &self.nodes
    }

    /// Waits until the worker has drained its queue, including any events
    /// produced while draining it.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        self.queue.push(ControllerEvent::Flush(tx));
        let _ = rx.await;
    }

    pub async fn stop(self) {
        self.services.registry.remove_listener(self.registry_listener);
        self.services.devices.remove_listener(self.device_listener);
        self.services.leadership.withdraw(&self.app_id);
        self.task.abort();
        let _ = self.task.await;
        info!("Node controller stopped");
    }
}
