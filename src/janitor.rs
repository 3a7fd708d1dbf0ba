//! Periodic cleanup of engine state.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::ratelimit::AdmissionController;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub records_removed: usize,
    pub buckets_removed: usize,
    pub alerts_removed: usize,
    pub deny_entries_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.records_removed + self.buckets_removed + self.alerts_removed + self.deny_entries_removed
    }
}

/// Background task running [`AdmissionController::sweep`] on a fixed interval.
pub struct Janitor;

impl Janitor {
    /// Spawn the cleanup loop on the current tokio runtime.
    ///
    /// The first sweep runs one full `every` after spawning.
    pub fn spawn(controller: Arc<AdmissionController>, every: Duration) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = controller.sweep();
                        if report.total() > 0 {
                            info!(
                                records = report.records_removed,
                                buckets = report.buckets_removed,
                                alerts = report.alerts_removed,
                                deny_entries = report.deny_entries_removed,
                                "Janitor sweep completed"
                            );
                        } else {
                            debug!("Janitor sweep found nothing to remove");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Janitor stopped");
                        break;
                    }
                }
            }
        });

        info!(interval_ms = every.as_millis() as u64, "Janitor started");
        JanitorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`Janitor`].
pub struct JanitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
