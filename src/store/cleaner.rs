//! Background reclaim task.
//!
//! One [`Cleaner`] per store periodically calls `reclaim`. A failed cycle is
//! logged and skipped; it never ends the loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Reclaim;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Lifecycle of a cleaner task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerState {
    /// Sleeping until the next cycle.
    Idle,
    /// Inside a `reclaim` call.
    Running,
    /// Terminal.
    Stopped,
}

/// Handle to a running cleaner task.
pub struct Cleaner {
    name: String,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<CleanerState>,
    handle: JoinHandle<()>,
}

impl Cleaner {
    /// Spawn a cleaner that reclaims `target` every `interval`.
    ///
    /// The first cycle runs one full interval after spawning.
    pub fn spawn(target: Arc<dyn Reclaim>, interval: Duration) -> Self {
        let name = target.name().to_string();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(CleanerState::Idle);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }

                state_tx.send_replace(CleanerState::Running);
                match target.reclaim().await {
                    Ok(count) => {
                        if count > 0 {
                            info!(store = %task_name, reclaimed = count, "Store cleanup completed");
                        } else {
                            debug!(store = %task_name, "Store cleanup: nothing expired");
                        }
                    }
                    Err(e) => {
                        warn!(store = %task_name, error = %e, "Store cleanup failed, skipping cycle");
                    }
                }
                state_tx.send_replace(CleanerState::Idle);

                if *stop_rx.borrow() {
                    break;
                }
            }

            state_tx.send_replace(CleanerState::Stopped);
            debug!(store = %task_name, "Cleaner stopped");
        });

        info!(store = %name, interval_ms = interval.as_millis() as u64, "Started store cleaner");

        Self {
            name,
            stop_tx,
            state_rx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CleanerState {
        *self.state_rx.borrow()
    }

    /// Stop the cleaner and wait for the task to exit.
    ///
    /// A cycle already in progress is allowed to finish.
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!(store = %self.name, error = %e, "Cleaner task ended abnormally");
        }
    }
}
