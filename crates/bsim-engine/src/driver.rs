//! Simulation Driver - real-time background tasks for the engine
//!
//! Runs:
//! - Transit ticker: advances virtual time by the wall-clock time elapsed
//!   since the previous tick
//! - Consumer poller: one delivery pass per poll interval
//!
//! Both tasks lock the shared simulator for the duration of one step, so all
//! mutation stays on one logical thread. Shutdown stops further ticks;
//! anything still traveling is abandoned.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use bsim_config::SimulatorConfig;

use crate::simulator::Simulator;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Transit tick period
    pub tick_interval: Duration,
    /// Consumer poll period
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::from(&SimulatorConfig::default())
    }
}

impl From<&SimulatorConfig> for DriverConfig {
    fn from(config: &SimulatorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            poll_interval: config.consumer_poll_interval(),
        }
    }
}

pub struct SimulationDriver {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulationDriver {
    /// Spawn the transit ticker and consumer poller
    pub fn start(simulator: Arc<Mutex<Simulator>>, config: DriverConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(2);

        // Transit ticker
        {
            let simulator = simulator.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.tick_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut last = Instant::now();

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let now = Instant::now();
                            let elapsed = now - last;
                            last = now;
                            simulator.lock().advance(elapsed);
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Transit ticker shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Consumer poller
        {
            let simulator = simulator.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.poll_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // first tick completes immediately; the first poll happens one interval in
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let delivered = simulator.lock().poll_consumers();
                            if delivered > 0 {
                                debug!(delivered, "Consumer poll delivered messages");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Consumer poller shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!(
            tick_ms = config.tick_interval.as_millis() as u64,
            poll_ms = config.poll_interval.as_millis() as u64,
            "Simulation driver started"
        );

        Self { shutdown_tx, tasks }
    }

    /// Signal both tasks to stop and wait for them to exit
    pub async fn shutdown(self) {
        info!("Shutting down simulation driver");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
