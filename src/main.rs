//! fabric-node daemon entry point.

use log::{error, info, warn};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;

use fabric_node::cluster::{LocalCluster, MemberId};
use fabric_node::config::Config;
use fabric_node::device::SimulatedFabric;
use fabric_node::registry::MemoryNodeRegistry;
use fabric_node::{ControllerHandle, ControllerSettings, NodeController, Services};

fn reload(controller: &ControllerHandle, cfg: &Config) {
    let Some(path) = &cfg.nodes_file else {
        warn!("No nodes_file configured, nothing to load");
        return;
    };
    if let Err(e) = controller.reload_from_file(path) {
        error!("Node set reload failed: {:#}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cfg = Config::load()?;
    info!("Starting fabric-node with config: {:?}", cfg);

    // Standalone mode: in-process registry and cluster over a simulated fabric
    let cluster = LocalCluster::new(MemberId::new(cfg.member_id.clone()), cfg.member_ip);
    let services = Services::simulated(MemoryNodeRegistry::new(), cluster, SimulatedFabric::new());
    let controller = NodeController::start(ControllerSettings::from(&cfg), services);

    let mut events = controller.subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Node {} is {}", event.node.hostname, event.state),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} lifecycle events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    reload(&controller, &cfg);

    let mut hangup = unix_signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading node set");
                reload(&controller, &cfg);
            }
        }
    }

    events_handle.abort();
    controller.stop().await;

    info!("Shutdown complete.");
    Ok(())
}
