//! Periodic health monitoring of running services.

use crate::manager::ServiceManager;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running health monitor task.
pub(crate) struct MonitorHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the monitor and wait for it to finish its current round.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
    }

    /// Signal the monitor and cancel it without waiting.
    ///
    /// Only safe while holding the manager's lifecycle lock, so the task
    /// cannot be in the middle of a restart.
    pub(crate) fn abort(self) {
        let _ = self.shutdown_tx.send(());
        self.task.abort();
    }
}

/// Spawn the monitor loop for `manager`, ticking every `interval`.
pub(crate) fn spawn(manager: ServiceManager, interval: Duration) -> MonitorHandle {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(run(manager, interval, shutdown_rx));
    MonitorHandle { shutdown_tx, task }
}

async fn run(manager: ServiceManager, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    info!(interval_secs = interval.as_secs(), "Health monitor started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; services were just started.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let restarted = manager.check_health().await;
                if restarted.is_empty() {
                    debug!("Health check round complete");
                } else {
                    info!(services = ?restarted, "Restarted unhealthy services");
                }
            }

            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    info!("Health monitor stopped");
}
