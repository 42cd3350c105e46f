//! # Dispatch Strategies
//!
//! A [`DispatchStrategy`] decides which [`Worker`] a watcher loop runs on.
//! It is injected into a session at construction and is the only component
//! that knows how many watcher threads exist.
//!
//! | Strategy | Key | Workers |
//! |----------|-----|---------|
//! | [`Single`] | none | one, shared by every watcher |
//! | [`PerCore`] | round-robin | `available_parallelism`, clamped to 1..=16 |
//! | [`PerTable`] | route table | one per table while a lease is alive |
//! | [`PerResource`] | resource id | one per resource while a lease is alive |
//! | [`PerWatcher`] | watcher id | a fresh one per watcher |
//!
//! Workers are reference counted. A lease is an `Arc<Worker>`; strategies
//! that share workers by key keep only a `Weak`, so a worker disappears as
//! soon as the last watcher using it stops.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::available_parallelism;

use parking_lot::Mutex;

use crate::error::Result;
use crate::route::Resource;
use crate::store::Store;
use crate::worker::Worker;

/// Lower bound on [`PerCore`] worker count.
pub const MIN_CORE_WORKERS: usize = 1;

/// Upper bound on [`PerCore`] worker count.
pub const MAX_CORE_WORKERS: usize = 16;

/// What a strategy may key a worker on.
#[derive(Debug, Clone)]
pub struct DispatchKey {
    /// Watcher id, unique within its session.
    pub watcher: u64,
    /// Route table.
    pub table: Arc<str>,
    /// Resource identifier.
    pub resource: Resource,
}

/// Maps watchers to workers.
pub trait DispatchStrategy: Send + Sync {
    /// Returns the worker for `key`, creating one if needed. The returned
    /// `Arc` is the lease; drop it when the watcher stops.
    fn acquire(&self, key: &DispatchKey) -> Result<Arc<Worker>>;

    /// Number of workers currently alive.
    fn live_workers(&self) -> usize;

    /// Short strategy name for logs.
    fn name(&self) -> &'static str;
}

fn thread_name(prefix: &str, n: usize) -> String {
    format!("livequery-{}-{}", prefix, n)
}

// =============================================================================
// Single
// =============================================================================

/// One global worker.
pub struct Single {
    store: Store,
    worker: Mutex<Option<Arc<Worker>>>,
}

impl Single {
    /// Creates the strategy. The worker starts on first use.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            worker: Mutex::new(None),
        }
    }
}

impl DispatchStrategy for Single {
    fn acquire(&self, _key: &DispatchKey) -> Result<Arc<Worker>> {
        let mut slot = self.worker.lock();
        if let Some(worker) = slot.as_ref() {
            return Ok(Arc::clone(worker));
        }
        let worker = Worker::spawn(&self.store, thread_name("watch", 0))?;
        *slot = Some(Arc::clone(&worker));
        Ok(worker)
    }

    fn live_workers(&self) -> usize {
        usize::from(self.worker.lock().is_some())
    }

    fn name(&self) -> &'static str {
        "single"
    }
}

// =============================================================================
// Per Core
// =============================================================================

/// A fixed set of workers, one per core, assigned round-robin.
pub struct PerCore {
    store: Store,
    size: usize,
    workers: Mutex<Vec<Arc<Worker>>>,
    next: AtomicUsize,
}

impl PerCore {
    /// Sizes the set from `available_parallelism`.
    pub fn new(store: Store) -> Self {
        let size = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_CORE_WORKERS)
            .clamp(MIN_CORE_WORKERS, MAX_CORE_WORKERS);
        Self::with_size(store, size)
    }

    /// Uses exactly `size` workers (at least one).
    pub fn with_size(store: Store, size: usize) -> Self {
        let size = size.max(1);
        Self {
            store,
            size,
            workers: Mutex::new(Vec::with_capacity(size)),
            next: AtomicUsize::new(0),
        }
    }

    /// Number of workers the set grows to.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl DispatchStrategy for PerCore {
    fn acquire(&self, _key: &DispatchKey) -> Result<Arc<Worker>> {
        let mut workers = self.workers.lock();
        if workers.len() < self.size {
            let worker = Worker::spawn(&self.store, thread_name("core", workers.len()))?;
            workers.push(Arc::clone(&worker));
            return Ok(worker);
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(Arc::clone(&workers[idx]))
    }

    fn live_workers(&self) -> usize {
        self.workers.lock().len()
    }

    fn name(&self) -> &'static str {
        "per-core"
    }
}

// =============================================================================
// Keyed
// =============================================================================

/// Workers shared by key, alive while any lease is.
struct KeyedWorkers<K> {
    store: Store,
    prefix: &'static str,
    workers: Mutex<HashMap<K, Weak<Worker>>>,
    spawned: AtomicUsize,
}

impl<K: Eq + Hash> KeyedWorkers<K> {
    fn new(store: Store, prefix: &'static str) -> Self {
        Self {
            store,
            prefix,
            workers: Mutex::new(HashMap::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    fn acquire(&self, key: K) -> Result<Arc<Worker>> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(&key).and_then(Weak::upgrade) {
            return Ok(worker);
        }
        workers.retain(|_, w| w.strong_count() > 0);

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(&self.store, thread_name(self.prefix, n))?;
        workers.insert(key, Arc::downgrade(&worker));
        Ok(worker)
    }

    fn live(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// One worker per route table.
pub struct PerTable {
    workers: KeyedWorkers<Arc<str>>,
}

impl PerTable {
    /// Creates the strategy.
    pub fn new(store: Store) -> Self {
        Self {
            workers: KeyedWorkers::new(store, "table"),
        }
    }
}

impl DispatchStrategy for PerTable {
    fn acquire(&self, key: &DispatchKey) -> Result<Arc<Worker>> {
        self.workers.acquire(Arc::clone(&key.table))
    }

    fn live_workers(&self) -> usize {
        self.workers.live()
    }

    fn name(&self) -> &'static str {
        "per-table"
    }
}

/// One worker per resource identifier.
pub struct PerResource {
    workers: KeyedWorkers<Resource>,
}

impl PerResource {
    /// Creates the strategy.
    pub fn new(store: Store) -> Self {
        Self {
            workers: KeyedWorkers::new(store, "resource"),
        }
    }
}

impl DispatchStrategy for PerResource {
    fn acquire(&self, key: &DispatchKey) -> Result<Arc<Worker>> {
        self.workers.acquire(key.resource.clone())
    }

    fn live_workers(&self) -> usize {
        self.workers.live()
    }

    fn name(&self) -> &'static str {
        "per-resource"
    }
}

/// A fresh worker for every watcher start.
pub struct PerWatcher {
    store: Store,
    workers: Mutex<Vec<Weak<Worker>>>,
    spawned: AtomicUsize,
}

impl PerWatcher {
    /// Creates the strategy.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
        }
    }
}

impl DispatchStrategy for PerWatcher {
    fn acquire(&self, _key: &DispatchKey) -> Result<Arc<Worker>> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(&self.store, thread_name("watch", n))?;

        let mut workers = self.workers.lock();
        workers.retain(|w| w.strong_count() > 0);
        workers.push(Arc::downgrade(&worker));
        Ok(worker)
    }

    fn live_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn name(&self) -> &'static str {
        "per-watcher"
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Selects a built-in strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// See [`Single`].
    Single,
    /// See [`PerCore`].
    PerCore,
    /// See [`PerTable`].
    PerTable,
    /// See [`PerResource`].
    PerResource,
    /// See [`PerWatcher`].
    #[default]
    PerWatcher,
}

impl DispatchPolicy {
    /// Builds the strategy over `store`.
    pub fn build(self, store: &Store) -> Arc<dyn DispatchStrategy> {
        let store = store.clone();
        match self {
            DispatchPolicy::Single => Arc::new(Single::new(store)),
            DispatchPolicy::PerCore => Arc::new(PerCore::new(store)),
            DispatchPolicy::PerTable => Arc::new(PerTable::new(store)),
            DispatchPolicy::PerResource => Arc::new(PerResource::new(store)),
            DispatchPolicy::PerWatcher => Arc::new(PerWatcher::new(store)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("s.db"), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn key(watcher: u64, table: &str, resource: &str) -> DispatchKey {
        DispatchKey {
            watcher,
            table: Arc::from(table),
            resource: Resource::new(resource),
        }
    }

    #[test]
    fn test_single_shares_one_worker() {
        let (_dir, store) = store();
        let strategy = Single::new(store);
        let a = strategy.acquire(&key(1, "notes", "notes/1")).unwrap();
        let b = strategy.acquire(&key(2, "tags", "tags/1")).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(strategy.live_workers(), 1);
    }

    #[test]
    fn test_per_core_round_robin() {
        let (_dir, store) = store();
        let strategy = PerCore::with_size(store, 2);
        let ids: Vec<u64> = (0..4)
            .map(|i| strategy.acquire(&key(i, "notes", "n")).unwrap().id())
            .collect();
        assert_eq!(strategy.live_workers(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids[2] == ids[0] || ids[2] == ids[1]);
        assert_ne!(ids[2], ids[3]);
    }

    #[test]
    fn test_per_table_shares_while_leased() {
        let (_dir, store) = store();
        let strategy = PerTable::new(store);
        let a = strategy.acquire(&key(1, "notes", "notes/1")).unwrap();
        let b = strategy.acquire(&key(2, "notes", "notes/2")).unwrap();
        let c = strategy.acquire(&key(3, "tags", "tags/1")).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(strategy.live_workers(), 2);

        drop(a);
        drop(b);
        assert_eq!(strategy.live_workers(), 1);
    }

    #[test]
    fn test_per_watcher_is_fresh_each_time() {
        let (_dir, store) = store();
        let strategy = DispatchPolicy::default().build(&store);
        assert_eq!(strategy.name(), "per-watcher");
        let a = strategy.acquire(&key(1, "notes", "notes/1")).unwrap();
        let b = strategy.acquire(&key(1, "notes", "notes/1")).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(strategy.live_workers(), 2);
        drop(a);
        assert_eq!(strategy.live_workers(), 1);
        drop(b);
    }
}
