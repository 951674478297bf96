//! Local registry snapshot
//!
//! The snapshot holds the last successfully fetched membership. A failed
//! refresh records the error and keeps serving the previous view; nothing
//! ever clears it because of age. Readers load a whole published view at
//! once, so they never see a half-applied refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use regcache_common::protocol::{Instance, InstanceId, Result};
use regcache_common::RegistryClient;
use tracing::debug;

/// Freshness of a snapshot relative to its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// No refresh has succeeded yet
    Uninitialized,
    Fresh,
    /// Older than the TTL; still served
    Stale,
}

/// One published view of the registry.
#[derive(Debug, Clone, Default)]
pub struct SnapshotView {
    instances: Arc<HashMap<InstanceId, Instance>>,
    refreshed_at: Option<Instant>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

impl SnapshotView {
    pub fn instances(&self) -> &Arc<HashMap<InstanceId, Instance>> {
        &self.instances
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time since the last successful refresh.
    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.map(|at| at.elapsed())
    }

    pub fn state(&self, ttl: Duration) -> SnapshotState {
        match self.age() {
            None => SnapshotState::Uninitialized,
            Some(age) if age > ttl => SnapshotState::Stale,
            Some(_) => SnapshotState::Fresh,
        }
    }
}

/// Time-bounded cache of the registry's membership.
pub struct RegistrySnapshot {
    current: ArcSwap<SnapshotView>,
    ttl: Duration,
}

impl RegistrySnapshot {
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: ArcSwap::from_pointee(SnapshotView::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current view, including refresh bookkeeping.
    pub fn view(&self) -> Arc<SnapshotView> {
        self.current.load_full()
    }

    /// Current membership, regardless of age. Never performs I/O.
    pub fn items(&self) -> Arc<HashMap<InstanceId, Instance>> {
        Arc::clone(&self.current.load().instances)
    }

    pub fn state(&self) -> SnapshotState {
        self.current.load().state(self.ttl)
    }

    pub fn len(&self) -> usize {
        self.current.load().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes a new membership and clears the failure record.
    pub fn replace(&self, instances: HashMap<InstanceId, Instance>) {
        self.current.store(Arc::new(SnapshotView {
            instances: Arc::new(instances),
            refreshed_at: Some(Instant::now()),
            last_error: None,
            consecutive_failures: 0,
        }));
    }

    /// Records a failed refresh, keeping the last-known-good membership.
    /// Returns the new consecutive failure count.
    pub fn record_failure(&self, error: &str) -> u32 {
        let updated = self.current.rcu(|view| SnapshotView {
            instances: Arc::clone(&view.instances),
            refreshed_at: view.refreshed_at,
            last_error: Some(error.to_string()),
            consecutive_failures: view.consecutive_failures.saturating_add(1),
        });
        // rcu hands back the view it replaced
        updated.consecutive_failures.saturating_add(1)
    }

    /// Fetches the membership once and publishes it.
    ///
    /// On failure the previous view stays in place and the error is both
    /// recorded and returned. On success returns the instance count.
    pub async fn refresh(&self, client: &dyn RegistryClient) -> Result<usize> {
        match client.list_instances().await {
            Ok(instances) => {
                let count = instances.len();
                self.replace(instances);
                debug!("Registry snapshot refreshed with {} instances", count);
                Ok(count)
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(names: &[(&str, &str, u16)]) -> HashMap<InstanceId, Instance> {
        names
            .iter()
            .map(|(name, host, port)| {
                let instance = Instance::new(*name, *host, *port);
                (instance.id.clone(), instance)
            })
            .collect()
    }

    #[test]
    fn test_starts_uninitialized() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        assert_eq!(snapshot.state(), SnapshotState::Uninitialized);
        assert!(snapshot.is_empty());
        assert!(snapshot.view().refreshed_at().is_none());
    }

    #[test]
    fn test_replace_makes_fresh() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        snapshot.replace(membership(&[("orders", "10.0.0.5", 9090)]));

        assert_eq!(snapshot.state(), SnapshotState::Fresh);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.items().contains_key("orders#10.0.0.5:9090"));
    }

    #[test]
    fn test_failure_keeps_last_known_good() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        snapshot.replace(membership(&[("orders", "10.0.0.5", 9090), ("orders", "10.0.0.6", 9090)]));

        assert_eq!(snapshot.record_failure("connection refused"), 1);
        assert_eq!(snapshot.record_failure("connection refused"), 2);

        let view = snapshot.view();
        assert_eq!(view.instances().len(), 2);
        assert_eq!(view.consecutive_failures(), 2);
        assert_eq!(view.last_error(), Some("connection refused"));
        assert!(view.refreshed_at().is_some());
    }

    #[test]
    fn test_replace_clears_failures() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        snapshot.record_failure("boom");
        assert_eq!(snapshot.state(), SnapshotState::Uninitialized);

        snapshot.replace(HashMap::new());
        let view = snapshot.view();
        assert_eq!(view.consecutive_failures(), 0);
        assert!(view.last_error().is_none());
        assert_eq!(snapshot.state(), SnapshotState::Fresh);
    }

    #[test]
    fn test_stale_after_ttl() {
        let snapshot = RegistrySnapshot::new(Duration::from_millis(10));
        snapshot.replace(membership(&[("a", "h", 1)]));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(snapshot.state(), SnapshotState::Stale);
        // still served
        assert_eq!(snapshot.items().len(), 1);
    }

    #[test]
    fn test_replace_drops_missing_instances() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        snapshot.replace(membership(&[("a", "h", 1), ("b", "h", 2)]));
        snapshot.replace(membership(&[("b", "h", 2)]));

        let items = snapshot.items();
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("b#h:2"));
    }

    #[test]
    fn test_readers_keep_old_view() {
        let snapshot = RegistrySnapshot::new(Duration::from_secs(10));
        snapshot.replace(membership(&[("a", "h", 1)]));
        let held = snapshot.items();

        snapshot.replace(HashMap::new());
        assert_eq!(held.len(), 1);
        assert!(snapshot.is_empty());
    }
}
