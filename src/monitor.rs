//! Per-entry expiry monitor
//!
//! Every resident entry gets one monitor task. The monitor ticks at the
//! entry's cadence, slides the deadline while the entry is referenced and
//! evicts it once a tick sees the deadline lapsed with no references left.
//! Cancellation (pool shutdown or a forced delete) sends the entry through
//! the same teardown.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::entry::Entry;
use crate::traits::StatefulService;

/// Keyed storage shared between the pool and its monitors
pub(crate) type Store<S> = DashMap<String, Arc<Entry<S>>>;

/// Why a monitor left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    Expired,
    Cancelled,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Nothing to do
    Unchanged,
    /// Deadline slid forward
    Renewed(Instant),
    /// Deadline lapsed but a reference appeared before eviction
    Reprieved,
    /// Entry removed from the store
    Expired,
}

pub(crate) struct ExpiryMonitor<S> {
    entry: Arc<Entry<S>>,
    store: Weak<Store<S>>,
}

impl<S: StatefulService> ExpiryMonitor<S> {
    pub fn new(entry: Arc<Entry<S>>, store: Weak<Store<S>>) -> Self {
        Self { entry, store }
    }

    /// Run until the entry expires or is cancelled, then tear it down
    pub async fn run(self) -> Teardown {
        let cadence = self.entry.config().refresh_interval;
        let mut ticker = time::interval_at(Instant::now() + cadence, cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.entry.cancelled() => break Teardown::Cancelled,
                _ = self.entry.became_idle() => {
                    if self.entry.ref_count() == 0 {
                        let deadline = self.entry.rearm_deadline(Instant::now());
                        ticker.reset();
                        debug!(key = self.entry.key(), ?deadline, "Service idle, expiry re-armed");
                    }
                }
                _ = ticker.tick() => {
                    if self.on_tick(Instant::now()) == TickOutcome::Expired {
                        break Teardown::Expired;
                    }
                }
            }
        };

        self.teardown(reason);
        reason
    }

    /// Evaluate the expiry and renewal rules at `now`
    pub(crate) fn on_tick(&self, now: Instant) -> TickOutcome {
        let deadline = self.entry.deadline();

        if now >= deadline && self.entry.ref_count() == 0 {
            return if self.try_evict() {
                TickOutcome::Expired
            } else {
                TickOutcome::Reprieved
            };
        }

        let cadence = self.entry.config().refresh_interval;
        if self.entry.ref_count() > 0 && now + cadence > deadline {
            let deadline = self.entry.extend_deadline();
            debug!(key = self.entry.key(), ?deadline, "Service deadline renewed");
            return TickOutcome::Renewed(deadline);
        }

        TickOutcome::Unchanged
    }

    /// Remove the entry if it is still unreferenced
    ///
    /// The count is re-checked under the shard write lock, so a concurrent
    /// `get` (which increments under the read lock) either lands first and
    /// keeps the entry alive or misses the entry entirely.
    fn try_evict(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            // Pool is gone; nothing left to remove from.
            return true;
        };

        let entry = &self.entry;
        if store
            .remove_if(entry.key(), |_, resident| {
                Arc::ptr_eq(resident, entry) && resident.ref_count() == 0
            })
            .is_some()
        {
            return true;
        }

        // Someone else already detached this entry.
        !store
            .get(entry.key())
            .is_some_and(|resident| Arc::ptr_eq(resident.value(), entry))
    }

    fn teardown(&self, reason: Teardown) {
        if let Some(store) = self.store.upgrade() {
            store.remove_if(self.entry.key(), |_, resident| Arc::ptr_eq(resident, &self.entry));
        }

        let closed = self.entry.close();
        self.entry.cancel();
        debug!(key = self.entry.key(), ?reason, closed, "Service evicted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Counted(AtomicUsize);

    impl StatefulService for Counted {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    const TTL: Duration = Duration::from_secs(10);

    fn resident(store: &Arc<Store<Counted>>, token: CancellationToken) -> Arc<Entry<Counted>> {
        let entry = Arc::new(Entry::new(
            "svc".to_string(),
            Arc::new(Counted::default()),
            EntryConfig::from_ttl(TTL),
            token,
        ));
        store.insert("svc".to_string(), Arc::clone(&entry));
        entry
    }

    fn closes(entry: &Entry<Counted>) -> usize {
        entry.value().0.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_renews_referenced_entry() {
        let store = Arc::new(Store::new());
        let entry = resident(&store, CancellationToken::new());
        let monitor = ExpiryMonitor::new(Arc::clone(&entry), Arc::downgrade(&store));
        let start = Instant::now();

        assert_eq!(monitor.on_tick(start + TTL / 2), TickOutcome::Unchanged);
        assert_eq!(
            monitor.on_tick(start + TTL),
            TickOutcome::Renewed(start + TTL * 2)
        );
        assert!(store.contains_key("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_expires_unreferenced_entry() {
        let store = Arc::new(Store::new());
        let entry = resident(&store, CancellationToken::new());
        let monitor = ExpiryMonitor::new(Arc::clone(&entry), Arc::downgrade(&store));
        let start = Instant::now();

        entry.sub();
        assert_eq!(monitor.on_tick(start + TTL / 2), TickOutcome::Unchanged);
        assert_eq!(monitor.on_tick(start + TTL), TickOutcome::Expired);
        assert!(!store.contains_key("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_evicts_one_ttl_after_release() {
        let store = Arc::new(Store::new());
        let entry = resident(&store, CancellationToken::new());
        let handle = tokio::spawn(
            ExpiryMonitor::new(Arc::clone(&entry), Arc::downgrade(&store)).run(),
        );

        time::sleep(Duration::from_secs(7)).await;
        entry.sub();

        time::sleep(TTL - Duration::from_millis(1)).await;
        assert!(store.contains_key("svc"));
        assert_eq!(closes(&entry), 0);

        time::sleep(Duration::from_millis(2)).await;
        assert!(!store.contains_key("svc"));
        assert_eq!(closes(&entry), 1);
        assert_eq!(handle.await.unwrap(), Teardown::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_tears_down() {
        let store = Arc::new(Store::new());
        let root = CancellationToken::new();
        let entry = resident(&store, root.child_token());
        let handle = tokio::spawn(
            ExpiryMonitor::new(Arc::clone(&entry), Arc::downgrade(&store)).run(),
        );

        root.cancel();
        assert_eq!(handle.await.unwrap(), Teardown::Cancelled);
        assert!(!store.contains_key("svc"));
        assert_eq!(closes(&entry), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_leaves_replacement_alone() {
        let store = Arc::new(Store::new());
        let token = CancellationToken::new();
        let stale = resident(&store, token.clone());
        let handle = tokio::spawn(
            ExpiryMonitor::new(Arc::clone(&stale), Arc::downgrade(&store)).run(),
        );

        store.remove("svc");
        let replacement = resident(&store, CancellationToken::new());
        token.cancel();
        handle.await.unwrap();

        let current = store.get("svc").map(|e| Arc::clone(e.value()));
        assert!(current.is_some_and(|e| Arc::ptr_eq(&e, &replacement)));
        assert_eq!(closes(&replacement), 0);
        assert_eq!(closes(&stale), 1);
    }
}
