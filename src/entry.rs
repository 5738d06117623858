//! Reference-counted, TTL-tracked wrapper around one live service

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::atomic::AtomicCell;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EntryConfig;
use crate::traits::StatefulService;

/// One resident pool slot
///
/// The deadline is written only by the entry's monitor. Callers touch the
/// reference count and nothing else.
pub(crate) struct Entry<S> {
    key: String,
    value: Arc<S>,
    ref_count: AtomicUsize,
    deadline: AtomicCell<Instant>,
    config: EntryConfig,
    idle: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<S: StatefulService> Entry<S> {
    /// A fresh entry holding one reference, due one TTL from now
    pub fn new(key: String, value: Arc<S>, config: EntryConfig, cancel: CancellationToken) -> Self {
        Self {
            key,
            value,
            ref_count: AtomicUsize::new(1),
            deadline: AtomicCell::new(Instant::now() + config.time_to_live),
            config,
            idle: Notify::new(),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Arc<S> {
        Arc::clone(&self.value)
    }

    pub fn config(&self) -> EntryConfig {
        self.config
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take one more reference, returning the new count
    pub fn add(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference, returning the new count
    ///
    /// The count never goes below zero; an unmatched release leaves it at
    /// zero and returns `None`. Reaching zero wakes the monitor.
    pub fn sub(&self) -> Option<usize> {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()?;

        let remaining = previous - 1;
        if remaining == 0 {
            self.idle.notify_one();
        }
        Some(remaining)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline.load()
    }

    /// Slide the deadline forward by one TTL
    pub(crate) fn extend_deadline(&self) -> Instant {
        let next = self.deadline.load() + self.config.time_to_live;
        self.deadline.store(next);
        next
    }

    /// Restart the TTL window from `now`
    pub(crate) fn rearm_deadline(&self, now: Instant) -> Instant {
        let next = now + self.config.time_to_live;
        self.deadline.store(next);
        next
    }

    pub(crate) async fn became_idle(&self) {
        self.idle.notified().await
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the underlying service unless it has been closed already
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.value.close();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Counted(AtomicUsize);

    impl StatefulService for Counted {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry(ttl: Duration) -> Entry<Counted> {
        Entry::new(
            "key".to_string(),
            Arc::new(Counted(AtomicUsize::new(0))),
            EntryConfig::from_ttl(ttl),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_refcount_sequence() {
        let entry = entry(Duration::from_secs(10));

        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.add(), 2);
        assert_eq!(entry.sub(), Some(1));
        assert_eq!(entry.sub(), Some(0));
    }

    #[tokio::test]
    async fn test_sub_clamps_at_zero() {
        let entry = entry(Duration::from_secs(10));

        assert_eq!(entry.sub(), Some(0));
        assert_eq!(entry.sub(), None);
        assert_eq!(entry.ref_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bookkeeping() {
        let ttl = Duration::from_secs(10);
        let start = Instant::now();
        let entry = entry(ttl);

        assert_eq!(entry.deadline(), start + ttl);
        assert_eq!(entry.extend_deadline(), start + ttl * 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        let now = Instant::now();
        assert_eq!(entry.rearm_deadline(now), now + ttl);
    }

    #[tokio::test]
    async fn test_close_runs_once() {
        let entry = entry(Duration::from_secs(10));

        assert!(entry.close());
        assert!(!entry.close());
        assert_eq!(entry.value().0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_to_zero_wakes_waiter() {
        let entry = entry(Duration::from_secs(10));

        entry.sub();
        tokio::time::timeout(Duration::from_secs(1), entry.became_idle())
            .await
            .unwrap();
    }
}
