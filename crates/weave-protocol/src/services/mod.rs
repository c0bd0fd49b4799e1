//! Background maintenance loops owned by the node.

mod maintenance;

pub use maintenance::{group_maintenance_tick, prekey_maintenance_tick, MaintenanceConfig};

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A loop that runs `tick` every `period` until stopped.
///
/// The first tick fires one full period after spawning.
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = name, "background task shutting down");
                        break;
                    }
                }
            }
        });
        tracing::debug!(task = name, period_ms = period.as_millis(), "background task started");
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "background task ended abnormally");
        }
    }
}
