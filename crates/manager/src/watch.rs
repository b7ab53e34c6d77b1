//! Cluster state watch mechanism
//!
//! Clients wait for a state newer than the version they already know

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Cluster state watch manager
#[derive(Clone, Default)]
pub struct ClusterStateWatcher {
    /// Known version -> waiters; one Notify is shared by every waiter of a version
    watches: Arc<Mutex<BTreeMap<u64, Arc<Notify>>>>,
}

impl ClusterStateWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in any version newer than `current_version`
    pub fn watch(&self, current_version: u64) -> Arc<Notify> {
        let mut watches = self.watches.lock();
        let notify = watches
            .entry(current_version)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        debug!("Registered watch for cluster state version {}", current_version);
        notify
    }

    /// Wake every waiter whose known version is older than `version`
    pub fn notify_version(&self, version: u64) {
        let mut watches = self.watches.lock();
        let newer = watches.split_off(&version);
        for (v, notify) in std::mem::replace(&mut *watches, newer) {
            debug!("Notifying watches for version {} (current: {})", v, version);
            notify.notify_waiters();
        }
    }

    /// Number of versions with registered waiters
    pub fn pending(&self) -> usize {
        self.watches.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_wakes_older_versions_only() {
        let watcher = ClusterStateWatcher::new();
        let old = watcher.watch(3);
        let current = watcher.watch(5);
        assert_eq!(watcher.pending(), 2);

        let waiter = {
            let old = old.clone();
            tokio::spawn(async move { old.notified().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        watcher.notify_version(5);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.pending(), 1);

        watcher.notify_version(6);
        assert_eq!(watcher.pending(), 0);
        drop(current);
    }
}
