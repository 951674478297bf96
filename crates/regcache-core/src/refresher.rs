use std::sync::Arc;
use std::time::Duration;

use regcache_common::SharedRegistryClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::snapshot::RegistrySnapshot;

/// Background task keeping a [`RegistrySnapshot`] current.
///
/// The first refresh runs immediately, then once per `interval`. A slow
/// registry call delays the next tick rather than stacking calls.
pub struct SnapshotRefresher {
    snapshot: Arc<RegistrySnapshot>,
    client: SharedRegistryClient,
    interval: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SnapshotRefresher {
    /// Creates a new refresher.
    ///
    /// # Arguments
    /// * `snapshot` - The snapshot to publish into
    /// * `client` - Registry the membership is read from
    /// * `interval` - Time between refreshes
    pub fn new(snapshot: Arc<RegistrySnapshot>, client: SharedRegistryClient, interval: Duration) -> Self {
        Self {
            snapshot,
            client,
            interval,
            shutdown: None,
        }
    }

    /// Stops the loop once `true` is sent on the channel (or its sender drops).
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Starts the refresher task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main refresh loop
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Snapshot refresher started (every {:?})", self.interval);

        loop {
            match self.shutdown.as_mut() {
                Some(shutdown) => {
                    tokio::select! {
                        _ = interval.tick() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                }
                None => {
                    interval.tick().await;
                }
            }
            self.refresh_once().await;
        }

        info!("Snapshot refresher stopped");
    }

    /// Runs one refresh cycle, logging the outcome.
    pub async fn refresh_once(&self) {
        match self.snapshot.refresh(self.client.as_ref()).await {
            Ok(count) => debug!("Refresh cycle complete: {} instances", count),
            Err(e) => {
                let failures = self.snapshot.view().consecutive_failures();
                warn!(
                    "Registry refresh failed ({} consecutive), serving last snapshot: {}",
                    failures, e
                );
            }
        }
    }
}
