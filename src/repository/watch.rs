//! The per-repository watch coordinator.
//!
//! Registrations live only in memory and are keyed by an opaque ID so the
//! owner can cancel in O(1). Completion always happens outside the
//! repository's writer lock: the commit pipeline collects the changed paths
//! while holding the lock, releases it, and only then calls
//! [`WatchCoordinator::notify`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    errors::{Result, StoreError},
    model::Revision,
    pattern::PathPattern,
};

struct Registration {
    last_known: i64,
    filter: PathPattern,
    sender: oneshot::Sender<Result<Revision>>,
}

/// Registry of pending watches for one repository.
#[derive(Default)]
pub struct WatchCoordinator {
    registrations: DashMap<u64, Registration>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WatchCoordinator {
    pub fn new() -> WatchCoordinator {
        WatchCoordinator::default()
    }

    /// Register a watcher. The returned receiver resolves once a newer
    /// revision touches the filter, or with an error on close.
    pub fn register(
        &self,
        last_known: i64,
        filter: PathPattern,
    ) -> (u64, oneshot::Receiver<Result<Revision>>) {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            let _ = sender.send(Err(closed_error()));
            return (id, receiver);
        }
        self.registrations.insert(
            id,
            Registration {
                last_known,
                filter,
                sender,
            },
        );
        // A close racing with the insert above must not strand the entry.
        if self.closed.load(Ordering::Acquire) {
            self.fail_all();
        }
        (id, receiver)
    }

    /// Drop a registration. Completed or unknown IDs are ignored.
    pub fn cancel(&self, id: u64) {
        self.registrations.remove(&id);
    }

    /// Complete every registration whose filter matches one of the changed
    /// paths with `revision`. Runs without any repository lock held.
    pub fn notify(&self, revision: Revision, changed_paths: &[String]) {
        let matched: Vec<u64> = self
            .registrations
            .iter()
            .filter(|entry| {
                let registration = entry.value();
                revision.as_i64() > registration.last_known
                    && changed_paths
                        .iter()
                        .any(|path| registration.filter.matches(path))
            })
            .map(|entry| *entry.key())
            .collect();
        if matched.is_empty() {
            return;
        }
        debug!(
            revision = revision.as_i64(),
            watchers = matched.len(),
            "completing watchers"
        );
        for id in matched {
            if let Some((_, registration)) = self.registrations.remove(&id) {
                let _ = registration.sender.send(Ok(revision));
            }
        }
    }

    /// Fail all current and future registrations with the close error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fail_all();
    }

    fn fail_all(&self) {
        let ids: Vec<u64> = self.registrations.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, registration)) = self.registrations.remove(&id) {
                let _ = registration.sender.send(Err(closed_error()));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.registrations.len()
    }
}

fn closed_error() -> StoreError {
    StoreError::Cancelled("repository is closing".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> PathPattern {
        PathPattern::compile(raw).unwrap()
    }

    #[tokio::test]
    async fn test_notify_completes_matching_watcher() {
        let coordinator = WatchCoordinator::new();
        let (_, rx) = coordinator.register(2, pattern("/a.json"));

        coordinator.notify(Revision::from(3), &["/a.json".to_string()]);
        assert_eq!(rx.await.unwrap().unwrap(), Revision::from(3));
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_path_stays_pending() {
        let coordinator = WatchCoordinator::new();
        let (_, mut rx) = coordinator.register(3, pattern("/b.json"));

        coordinator.notify(Revision::from(4), &["/a.json".to_string()]);
        assert_eq!(coordinator.pending(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_revision_never_completes() {
        // Watch safety: completion revision must exceed last_known.
        let coordinator = WatchCoordinator::new();
        let (_, mut rx) = coordinator.register(5, pattern("/a.json"));

        coordinator.notify(Revision::from(5), &["/a.json".to_string()]);
        coordinator.notify(Revision::from(4), &["/a.json".to_string()]);
        assert_eq!(coordinator.pending(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_silent() {
        let coordinator = WatchCoordinator::new();
        let (id, mut rx) = coordinator.register(1, pattern("/**"));
        coordinator.cancel(id);
        assert_eq!(coordinator.pending(), 0);

        coordinator.notify(Revision::from(2), &["/a.json".to_string()]);
        // Sender dropped on cancel, so the receiver errors rather than
        // yielding a revision.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future() {
        let coordinator = WatchCoordinator::new();
        let (_, rx) = coordinator.register(1, pattern("/**"));
        coordinator.close();
        assert!(matches!(rx.await.unwrap(), Err(StoreError::Cancelled(_))));

        let (_, rx) = coordinator.register(1, pattern("/**"));
        assert!(matches!(rx.await.unwrap(), Err(StoreError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_one_commit_completes_many() {
        let coordinator = WatchCoordinator::new();
        let (_, rx_a) = coordinator.register(1, pattern("/a/**"));
        let (_, rx_b) = coordinator.register(1, pattern("*.json"));
        let (_, mut rx_c) = coordinator.register(1, pattern("/c.txt"));

        coordinator.notify(Revision::from(2), &["/a/x.json".to_string()]);
        assert_eq!(rx_a.await.unwrap().unwrap(), Revision::from(2));
        assert_eq!(rx_b.await.unwrap().unwrap(), Revision::from(2));
        assert!(rx_c.try_recv().is_err());
    }
}
