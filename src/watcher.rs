//! # Change Watchers
//!
//! A [`ChangeWatcher`] is one live subscription: it re-runs a read plan every
//! time the rows behind its route change, and hands each result to the
//! caller's listener on the caller's dispatcher.
//!
//! ```text
//!  start(lease)
//!     │  1. subscribe to bus (capacity-1 token channel)
//!     │  2. spawn loop on the leased worker
//!     ▼
//!  ┌──────────── worker thread ────────────┐       caller dispatcher
//!  │ validate table ── unknown ──▶ on_error ├──────▶ ┌──────────────┐
//!  │ initial run ───────────────▶ deliver ──┼──────▶ │ on_result(v) │
//!  │ loop {                                 │       └──────────────┘
//!  │   select! { stop  => break,            │
//!  │             token => run, deliver }    │
//!  │ }                                      │
//!  └────────────────────────────────────────┘
//! ```
//!
//! ## Coalescing
//!
//! The bus subscription is created before the initial run. Changes that
//! land while a run is in flight leave at most one token behind, so any
//! burst of changes during a run triggers exactly one more run.
//!
//! ## Generations
//!
//! Every `start` and `stop` bumps the watcher's generation. A result is only
//! delivered if its generation is still current when the dispatcher gets to
//! it, so nothing from a stopped loop reaches the listener. A loop that ends
//! on its own (unknown table, bus gone) clears its running entry, which gives
//! back the worker lease, but leaves the generation alone.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::bus::{BusSubscription, ChangeBus, SubscriberId};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::plan::ReadPlan;
use crate::route::{Resource, Route};
use crate::statement::{self, StatementBuffer};
use crate::strategy::DispatchKey;
use crate::worker::Worker;

// =============================================================================
// Listener
// =============================================================================

/// Receives a watcher's results. Called on the dispatcher given at submit.
pub trait WatchListener<V>: Send + Sync {
    /// A fresh result of the watched read.
    fn on_result(&self, outcome: Outcome<V>);

    /// The watcher could not produce a result.
    fn on_error(&self, error: Arc<Error>) {
        warn!(error = %error, "unhandled watcher error");
    }
}

/// What to watch: the plan, who to tell, and where to tell them.
pub struct Watch<V> {
    plan: Arc<dyn ReadPlan<V>>,
    listener: Arc<dyn WatchListener<V>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<V> Watch<V> {
    /// Bundles a plan, a listener, and the dispatcher results go to.
    pub fn new(
        plan: Arc<dyn ReadPlan<V>>,
        listener: Arc<dyn WatchListener<V>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            plan,
            listener,
            dispatcher,
        }
    }
}

// =============================================================================
// Watcher
// =============================================================================

struct Running {
    subscriber: SubscriberId,
    stop: oneshot::Sender<()>,
    _lease: Arc<Worker>,
}

struct WatcherInner<V> {
    id: u64,
    route: Route,
    resource: Resource,
    plan: Mutex<Arc<dyn ReadPlan<V>>>,
    listener: Arc<dyn WatchListener<V>>,
    dispatcher: Arc<dyn Dispatcher>,
    bus: ChangeBus,
    generation: AtomicU64,
    running: Mutex<Option<Running>>,
    runs: AtomicU64,
}

impl<V: Send + 'static> WatcherInner<V> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn deliver(self: &Arc<Self>, generation: u64, outcome: Outcome<V>) {
        let watcher = Arc::clone(self);
        self.dispatcher.dispatch(Box::new(move || {
            if watcher.is_current(generation) {
                watcher.listener.on_result(outcome);
            } else {
                trace!(watcher = watcher.id, "dropping result of stopped watcher");
            }
        }));
    }

    fn deliver_error(self: &Arc<Self>, generation: u64, error: Error) {
        let watcher = Arc::clone(self);
        let error = Arc::new(error);
        self.dispatcher.dispatch(Box::new(move || {
            if watcher.is_current(generation) {
                watcher.listener.on_error(error);
            }
        }));
    }

    /// Clears the running entry of a loop that ended on its own.
    ///
    /// The generation is left alone so an error already on its way to the
    /// listener is still delivered. Does nothing if the loop was stopped or
    /// replaced meanwhile.
    fn finish(&self, generation: u64) {
        let running = {
            let mut running = self.running.lock();
            if !self.is_current(generation) {
                return;
            }
            running.take()
        };

        if let Some(running) = running {
            self.bus.unsubscribe(running.subscriber);
            debug!(watcher = self.id, "watcher loop ended; lease released");
        }
    }
}

/// One live subscription. Cloning gives another handle to the same watcher.
pub struct ChangeWatcher<V> {
    inner: Arc<WatcherInner<V>>,
}

impl<V> Clone for ChangeWatcher<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + 'static> ChangeWatcher<V> {
    /// Creates a stopped watcher.
    pub fn new(id: u64, route: Route, resource: Resource, watch: Watch<V>, bus: ChangeBus) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                id,
                route,
                resource,
                plan: Mutex::new(watch.plan),
                listener: watch.listener,
                dispatcher: watch.dispatcher,
                bus,
                generation: AtomicU64::new(0),
                running: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Identifier within the owning session.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The watched route.
    pub fn route(&self) -> &Route {
        &self.inner.route
    }

    /// The watched resource.
    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    /// Key a dispatch strategy maps this watcher by.
    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey {
            watcher: self.inner.id,
            table: self.inner.route.table_arc(),
            resource: self.inner.resource.clone(),
        }
    }

    /// True while a loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Number of reads performed so far.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Starts the loop on `lease`.
    ///
    /// Fails with [`Error::WatcherAlreadyRunning`] if a loop is already
    /// running; the existing loop is left alone.
    pub fn start(&self, lease: Arc<Worker>) -> Result<()> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            warn!(watcher = self.inner.id, "start called on a running watcher");
            return Err(Error::WatcherAlreadyRunning {
                watcher: self.inner.id,
            });
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let subscription = self.inner.bus.subscribe(&self.inner.route);
        let subscriber = subscription.id();
        let (stop_tx, stop_rx) = oneshot::channel();

        let inner = Arc::downgrade(&self.inner);
        lease.execute(Box::new(move |conn: Rc<Connection>| {
            run_loop(inner, conn, subscription, stop_rx, generation).boxed_local()
        }))?;

        debug!(
            watcher = self.inner.id,
            table = self.inner.route.table_name(),
            worker = lease.name(),
            "watcher started"
        );

        *running = Some(Running {
            subscriber,
            stop: stop_tx,
            _lease: lease,
        });
        Ok(())
    }

    /// Stops the loop and releases the worker lease.
    ///
    /// Returns false if the watcher was not running. Safe from any thread.
    pub fn stop(&self) -> bool {
        let running = {
            let mut running = self.inner.running.lock();
            let Some(running) = running.take() else {
                return false;
            };
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            running
        };

        self.inner.bus.unsubscribe(running.subscriber);
        let _ = running.stop.send(());
        debug!(watcher = self.inner.id, "watcher stopped");
        true
    }

    /// Hands `error` to the listener's `on_error` on the listener's
    /// dispatcher. Used when the loop could not be started at all.
    pub fn fail(&self, error: Error) {
        let generation = self.inner.generation.load(Ordering::Acquire);
        self.inner.deliver_error(generation, error);
    }
}

// =============================================================================
// Loop
// =============================================================================

async fn run_loop<V: Send + 'static>(
    inner: Weak<WatcherInner<V>>,
    conn: Rc<Connection>,
    subscription: BusSubscription,
    stop: oneshot::Receiver<()>,
    generation: u64,
) {
    drive(&inner, &conn, subscription, stop, generation).await;
    trace!(generation, "watcher loop exited");

    if let Some(watcher) = inner.upgrade() {
        watcher.finish(generation);
    }
}

async fn drive<V: Send + 'static>(
    inner: &Weak<WatcherInner<V>>,
    conn: &Connection,
    mut subscription: BusSubscription,
    mut stop: oneshot::Receiver<()>,
    generation: u64,
) {
    {
        let Some(watcher) = inner.upgrade() else {
            return;
        };
        let checked = statement::require_table(conn, watcher.route.table_name());
        if let Err(e) = checked {
            warn!(watcher = watcher.id, error = %e, "watcher route does not resolve");
            watcher.deliver_error(generation, e);
            return;
        }
    }

    let mut buffer = StatementBuffer::default();
    if !run_once(inner, conn, &mut buffer, generation) {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            token = subscription.recv() => match token {
                Some(_) => {
                    if !run_once(inner, conn, &mut buffer, generation) {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Reads once and delivers. Returns false once the loop should end.
fn run_once<V: Send + 'static>(
    inner: &Weak<WatcherInner<V>>,
    conn: &Connection,
    buffer: &mut StatementBuffer,
    generation: u64,
) -> bool {
    let Some(watcher) = inner.upgrade() else {
        return false;
    };
    if !watcher.is_current(generation) {
        return false;
    }

    let plan = Arc::clone(&*watcher.plan.lock());
    watcher.runs.fetch_add(1, Ordering::Relaxed);

    let result = if plan.is_empty() {
        Ok(Outcome::Absent)
    } else {
        statement::select(conn, &watcher.route, &plan.projection(), buffer).and_then(|rows| {
            let single_row = watcher.route.is_single_row();
            panic::catch_unwind(AssertUnwindSafe(|| {
                if rows.is_empty() && single_row {
                    Outcome::Absent
                } else {
                    plan.read(rows).get()
                }
            }))
            .map_err(Error::from_panic)
        })
    };

    match result {
        Ok(outcome) => {
            if let Some(next) = plan.refresh(&outcome) {
                // A restarted watcher owns the plan; a stale run must not replace it.
                let mut current = watcher.plan.lock();
                if watcher.is_current(generation) {
                    *current = next;
                }
            }
            watcher.deliver(generation, outcome);
        }
        Err(e) => {
            debug!(watcher = watcher.id, error = %e, "watcher read failed");
            watcher.deliver_error(generation, e);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::inline;
    use crate::plan::{FnReadPlan, Projection, Rows};
    use crate::store::{Store, StoreConfig};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Channel(Mutex<mpsc::Sender<Outcome<usize>>>);

    impl WatchListener<usize> for Channel {
        fn on_result(&self, outcome: Outcome<usize>) {
            let _ = self.0.lock().send(outcome);
        }
    }

    fn count_plan() -> Arc<dyn ReadPlan<usize>> {
        Arc::new(FnReadPlan::new(Projection::All, |rows: &Rows| {
            Outcome::Value(rows.len())
        }))
    }

    #[test]
    fn test_initial_run_and_rerun_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("w.db"), StoreConfig::default()).unwrap();
        store.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY)").unwrap();

        let (tx, rx) = mpsc::channel();
        let watcher = ChangeWatcher::new(
            1,
            Route::table("notes"),
            Resource::new("notes"),
            Watch::new(count_plan(), Arc::new(Channel(Mutex::new(tx))), inline()),
            store.bus().clone(),
        );
        let worker = Worker::spawn(&store, "watch-test").unwrap();
        watcher.start(Arc::clone(&worker)).unwrap();

        let wait = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(wait).unwrap(), Outcome::Value(0));

        store.execute_batch("INSERT INTO notes DEFAULT VALUES").unwrap();
        assert_eq!(rx.recv_timeout(wait).unwrap(), Outcome::Value(1));

        assert!(matches!(
            watcher.start(worker),
            Err(Error::WatcherAlreadyRunning { watcher: 1 })
        ));

        assert!(watcher.stop());
        assert!(!watcher.stop());
        assert_eq!(store.bus().subscriber_count(), 0);
    }
}
