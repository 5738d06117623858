//! Keyed service pool

use crate::config::{EntryConfig, PoolConfiguration};
use crate::entry::Entry;
use crate::errors::{PoolError, PoolResult};
use crate::monitor::{ExpiryMonitor, Store};
use crate::traits::{ServiceFactory, StatefulService};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Shared state behind every clone of a [`ServicePool`]
struct PoolInner<K: ?Sized, S> {
    store: Arc<Store<S>>,
    /// Per-key creation gates; concurrent misses on one key queue here
    inflight: DashMap<String, Arc<Mutex<()>>>,
    /// Services force-deleted while still referenced, by allocation address
    retired: DashMap<usize, Retired<S>>,
    factory: Box<dyn ServiceFactory<K, S>>,
    config: PoolConfiguration,
    shutdown: CancellationToken,
    monitors: TaskTracker,
    runtime: Handle,
}

/// A deleted service whose holders have not all released it yet
///
/// The `Weak` keeps the allocation (and so the address key) from being
/// reused while the record exists.
struct Retired<S> {
    value: Weak<S>,
    outstanding: usize,
}

/// Removes a creation gate once its creator is done, panicking or not
struct GateRelease<'a> {
    inflight: &'a DashMap<String, Arc<Mutex<()>>>,
    slot: &'a str,
    gate: &'a Arc<Mutex<()>>,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(self.slot, |_, current| Arc::ptr_eq(current, self.gate));
    }
}

impl<K: ?Sized, S> Drop for PoolInner<K, S> {
    fn drop(&mut self) {
        // Orphaned monitors close their services directly.
        self.shutdown.cancel();
    }
}

/// Pool of shared, reference-counted services addressed by key
///
/// `get` hands out the resident service for a key (creating it on first
/// use), `put` releases one reference, and every entry's monitor evicts and
/// closes the service once it has sat unreferenced for a TTL. Keys are
/// identified by their `Display` form: two keys that print the same share a
/// slot.
///
/// The pool must be created inside a Tokio runtime; afterwards it may be
/// used from any thread.
///
/// # Examples
///
/// ```
/// use esox_servicepool::{PoolConfiguration, ServicePool, StatefulService};
/// use std::time::Duration;
///
/// struct Client(String);
///
/// impl StatefulService for Client {
///     fn close(&self) {}
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let config = PoolConfiguration::new().with_ttl(Duration::from_secs(30));
///     let pool: ServicePool<str, Client> =
///         ServicePool::new(|host: &str| Client(host.to_string()), config).unwrap();
///
///     let first = pool.get("api.local").unwrap();
///     let second = pool.get("api.local").unwrap();
///     assert!(std::sync::Arc::ptr_eq(&first, &second));
///     assert_eq!(pool.ref_count("api.local"), Some(2));
///
///     pool.put("api.local", first).unwrap();
///     pool.put("api.local", second).unwrap();
///     assert_eq!(pool.ref_count("api.local"), Some(0));
///
///     pool.shutdown().await;
///     assert!(pool.is_empty());
/// }
/// ```
pub struct ServicePool<K: ?Sized, S> {
    inner: Arc<PoolInner<K, S>>,
}

impl<K: ?Sized, S> Clone for ServicePool<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, S> ServicePool<K, S>
where
    K: Display + ?Sized + 'static,
    S: StatefulService,
{
    /// Create a new pool around a service factory
    ///
    /// Fails when the configuration is invalid or no Tokio runtime is
    /// available to host the expiry monitors.
    pub fn new<F>(factory: F, config: PoolConfiguration) -> PoolResult<Self>
    where
        F: ServiceFactory<K, S> + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                store: Arc::new(DashMap::new()),
                inflight: DashMap::new(),
                retired: DashMap::new(),
                factory: Box::new(factory),
                config,
                shutdown: CancellationToken::new(),
                monitors: TaskTracker::new(),
                runtime,
            }),
        })
    }

    /// Create a pool with the default configuration
    pub fn with_defaults<F>(factory: F) -> PoolResult<Self>
    where
        F: ServiceFactory<K, S> + 'static,
    {
        Self::new(factory, PoolConfiguration::default())
    }

    /// Get the shared service for `key`, creating it on first use
    ///
    /// A hit takes one more reference on the resident entry. A miss calls
    /// the factory synchronously; concurrent misses on the same key share
    /// one factory call.
    pub fn get(&self, key: &K) -> PoolResult<Arc<S>> {
        self.acquire(key, self.inner.config.entry_config())
    }

    /// Like [`get`](Self::get), but an entry created by this call uses `ttl`
    ///
    /// A resident entry keeps the settings it was created with. A zero
    /// `ttl` falls back to the pool default.
    pub fn get_with_ttl(&self, key: &K, ttl: Duration) -> PoolResult<Arc<S>> {
        self.acquire(key, self.inner.config.entry_config_with_ttl(ttl))
    }

    /// Release one reference on `key`
    ///
    /// When no entry is resident for `key`, `value` is adopted as a new entry
    /// holding one reference. Handing a service back to a pool that has
    /// forgotten it therefore starts tracking it again; it does not count as
    /// a release.
    ///
    /// A service that was force-deleted with [`del`](Self::del) while still
    /// referenced is never adopted again: handing it back just settles the
    /// holder's reference.
    ///
    /// Releasing more references than were taken leaves the count at zero
    /// and returns [`PoolError::ReleaseUnderflow`].
    pub fn put(&self, key: &K, value: Arc<S>) -> PoolResult<()> {
        let slot = key.to_string();

        if self.settle_retired(&value, &slot) {
            return Ok(());
        }

        if let Some(resident) = self.inner.store.get(&slot) {
            return Self::release(&resident, &slot);
        }

        self.ensure_running()?;
        self.adopt(slot, value)
    }

    /// Force eviction of `key`, regardless of outstanding references
    ///
    /// Returns whether an entry was resident. The service is removed from
    /// the pool before it is closed, so no caller can obtain it afterwards.
    pub fn del(&self, key: &K) -> bool {
        let slot = key.to_string();

        match self.inner.store.remove(&slot) {
            Some((_, entry)) => {
                entry.cancel();
                let refs = entry.ref_count();
                if refs > 0 {
                    self.retire(&entry.value(), refs);
                }
                let closed = entry.close();
                debug!(key = %slot, refs, closed, "Service deleted");
                true
            }
            None => false,
        }
    }

    /// Cancel every monitor and wait for all resident services to close
    ///
    /// Later `get` and `put` calls fail with [`PoolError::ShutDown`].
    pub async fn shutdown(&self) {
        debug!(resident = self.len(), "Shutting down service pool");
        self.inner.shutdown.cancel();
        self.inner.monitors.close();
        self.inner.monitors.wait().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.store.contains_key(&key.to_string())
    }

    /// Current reference count of the resident entry for `key`
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.inner
            .store
            .get(&key.to_string())
            .map(|entry| entry.ref_count())
    }

    /// Current expiry deadline of the resident entry for `key`
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.inner
            .store
            .get(&key.to_string())
            .map(|entry| entry.deadline())
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    fn acquire(&self, key: &K, config: EntryConfig) -> PoolResult<Arc<S>> {
        self.ensure_running()?;
        let slot = key.to_string();

        if let Some(value) = self.acquire_resident(&slot) {
            return Ok(value);
        }

        let gate = Arc::clone(&*self.inner.inflight.entry(slot.clone()).or_default());
        let _release = GateRelease {
            inflight: &self.inner.inflight,
            slot: &slot,
            gate: &gate,
        };
        let _creating = gate.lock();

        match self.acquire_resident(&slot) {
            Some(value) => Ok(value),
            None => self.create(key, slot.clone(), config),
        }
    }

    /// Take a reference on the resident entry, under the shard read lock
    fn acquire_resident(&self, slot: &str) -> Option<Arc<S>> {
        self.inner.store.get(slot).map(|entry| {
            entry.add();
            Entry::value(&entry)
        })
    }

    fn create(&self, key: &K, slot: String, config: EntryConfig) -> PoolResult<Arc<S>> {
        let value = Arc::new(self.inner.factory.create(key));
        let entry = self.new_entry(slot.clone(), Arc::clone(&value), config);

        match self.inner.store.entry(slot) {
            Slot::Occupied(occupied) => {
                // Adopted by a concurrent `put`; ours was never handed out.
                let resident = occupied.get();
                resident.add();
                let shared = resident.value();
                drop(occupied);
                entry.close();
                debug!(key = entry.key(), "Discarded duplicate service");
                Ok(shared)
            }
            Slot::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                debug!(key = entry.key(), ttl = ?config.time_to_live, "Service created");
                self.start_monitor(entry)?;
                Ok(value)
            }
        }
    }

    /// Track a handed-back service with one reference, or release the
    /// resident entry if one appeared since the caller's lookup
    fn adopt(&self, slot: String, value: Arc<S>) -> PoolResult<()> {
        let entry = self.new_entry(slot.clone(), value, self.inner.config.entry_config());

        match self.inner.store.entry(slot) {
            Slot::Occupied(occupied) => {
                let slot = occupied.key().clone();
                Self::release(occupied.get(), &slot)
            }
            Slot::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                debug!(key = entry.key(), "Untracked service adopted");
                self.start_monitor(entry)
            }
        }
    }

    /// Spawn the monitor for a freshly inserted entry
    ///
    /// A shutdown that began before the spawn may already have finished
    /// waiting for monitors, so the entry is torn down here instead and
    /// the caller gets [`PoolError::ShutDown`].
    fn start_monitor(&self, entry: Arc<Entry<S>>) -> PoolResult<()> {
        self.spawn_monitor(Arc::clone(&entry));

        if self.is_shut_down() {
            self.inner
                .store
                .remove_if(entry.key(), |_, resident| Arc::ptr_eq(resident, &entry));
            entry.cancel();
            entry.close();
            debug!(key = entry.key(), "Service closed, pool shut down during creation");
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }

    fn retire(&self, value: &Arc<S>, outstanding: usize) {
        self.inner
            .retired
            .retain(|_, retired| retired.value.strong_count() > 0);
        self.inner.retired.insert(
            Arc::as_ptr(value) as usize,
            Retired {
                value: Arc::downgrade(value),
                outstanding,
            },
        );
    }

    /// Absorb a release of a force-deleted service
    fn settle_retired(&self, value: &Arc<S>, slot: &str) -> bool {
        match self.inner.retired.entry(Arc::as_ptr(value) as usize) {
            Slot::Occupied(mut retired) => {
                let record = retired.get_mut();
                record.outstanding = record.outstanding.saturating_sub(1);
                if record.outstanding == 0 {
                    retired.remove();
                }
                debug!(key = slot, "Released reference to deleted service");
                true
            }
            Slot::Vacant(_) => false,
        }
    }

    fn new_entry(&self, slot: String, value: Arc<S>, config: EntryConfig) -> Arc<Entry<S>> {
        Arc::new(Entry::new(
            slot,
            value,
            config,
            self.inner.shutdown.child_token(),
        ))
    }

    fn spawn_monitor(&self, entry: Arc<Entry<S>>) {
        let monitor = ExpiryMonitor::new(entry, Arc::downgrade(&self.inner.store));
        self.inner
            .monitors
            .spawn_on(monitor.run(), &self.inner.runtime);
    }

    fn release(entry: &Entry<S>, slot: &str) -> PoolResult<()> {
        match entry.sub() {
            Some(_) => Ok(()),
            None => {
                warn!(key = slot, "Service released more often than acquired");
                Err(PoolError::ReleaseUnderflow(slot.to_string()))
            }
        }
    }

    fn ensure_running(&self) -> PoolResult<()> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }
}
