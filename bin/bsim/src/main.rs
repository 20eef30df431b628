//! BrokerSim Headless Runner
//!
//! Loads a topology, publishes a batch of messages from the first producer and
//! drives the engine in real time, then prints the final statistics as JSON.
//!
//! ## Environment
//!
//! - `BSIM_CONFIG`: TOML config path (otherwise defaults plus `BSIM_*` overrides)
//! - `BSIM_DIAGRAM`: exported diagram JSON to load instead of a template
//! - `BSIM_TEMPLATE`: built-in template id (default `routing`)
//! - `BSIM_ROUTING_KEYS`: comma-separated keys, one message each
//!   (default: every binding key of the loaded topology)
//! - `BSIM_RUN_SECS`: how long to run (default 5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bsim_common::{Headers, NodeType};
use bsim_config::SimulatorConfig;
use bsim_engine::{DriverConfig, SimulationDriver, Simulator};

const DEFAULT_TEMPLATE: &str = "routing";
const DEFAULT_RUN_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting BrokerSim runner");

    // 1. Configuration
    let config = match std::env::var("BSIM_CONFIG") {
        Ok(path) => SimulatorConfig::load(&path).with_context(|| format!("loading config {}", path))?,
        Err(_) => SimulatorConfig::from_env().context("reading BSIM_* overrides")?,
    };
    let run_secs = std::env::var("BSIM_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RUN_SECS);

    // 2. Topology
    let mut simulator = Simulator::new(config.clone());
    match std::env::var("BSIM_DIAGRAM") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading diagram {}", path))?;
            simulator.import_json(&text).with_context(|| format!("importing diagram {}", path))?;
        }
        Err(_) => {
            let template = std::env::var("BSIM_TEMPLATE").unwrap_or_else(|_| DEFAULT_TEMPLATE.to_string());
            simulator.load_template(&template)?;
        }
    }

    // 3. Publish
    let routing_keys = load_routing_keys(&simulator);
    match first_producer(&simulator) {
        Some(producer_id) => {
            for (n, key) in routing_keys.iter().enumerate() {
                simulator.send_message(&producer_id, format!("message {}", n + 1), key.clone(), Headers::new());
            }
            info!(
                producer_id = %producer_id,
                count = routing_keys.len(),
                "Published messages"
            );
        }
        None => warn!("Topology has no producer; nothing to publish"),
    }

    log_startup_summary(&simulator, run_secs);

    // 4. Run
    let simulator = Arc::new(Mutex::new(simulator));
    let driver = SimulationDriver::start(simulator.clone(), DriverConfig::from(&config));

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(run_secs)) => {
            info!("Run time elapsed");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received...");
        }
    }

    driver.shutdown().await;

    let stats = simulator.lock().stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    info!("BrokerSim runner finished");
    Ok(())
}

/// `BSIM_ROUTING_KEYS`, or every exchange binding key in topology order
fn load_routing_keys(simulator: &Simulator) -> Vec<String> {
    if let Ok(keys) = std::env::var("BSIM_ROUTING_KEYS") {
        return keys.split(',').map(|k| k.trim().to_string()).collect();
    }

    let mut keys: Vec<String> = Vec::new();
    for connection in simulator.connections() {
        let from_exchange = simulator
            .node(&connection.source_id)
            .is_some_and(|n| n.node_type() == NodeType::Exchange);
        if from_exchange && !keys.contains(&connection.routing_key) {
            keys.push(connection.routing_key.clone());
        }
    }
    keys
}

fn first_producer(simulator: &Simulator) -> Option<String> {
    simulator
        .nodes()
        .find(|n| n.node_type() == NodeType::Producer)
        .map(|n| n.id.clone())
}

fn log_startup_summary(simulator: &Simulator, run_secs: u64) {
    let topology = simulator.topology();
    let config = simulator.config();

    info!("=== BrokerSim Startup Summary ===");
    info!("  Producers: {}", topology.count_of(NodeType::Producer));
    info!("  Exchanges: {}", topology.count_of(NodeType::Exchange));
    info!("  Queues: {}", topology.count_of(NodeType::Queue));
    info!("  Consumers: {}", topology.count_of(NodeType::Consumer));
    info!("  Bindings: {}", topology.connection_count());
    info!("  Hop time: {:?}", config.hop_duration());
    info!("  Consumer poll: {:?}", config.consumer_poll_interval());
    info!("  Run time: {}s", run_secs);
    info!("=================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
