//! # Execution Context
//!
//! The [`ExecutionContext`] runs units of database work on a fixed pool of
//! worker threads and hands back an [`AsyncResult`] without ever blocking the
//! caller.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ExecutionContext                           │
//! │                                                                   │
//! │  submit(unit) ──▶ mpsc (unbounded) ──▶ ┌──────────┐ ┌──────────┐  │
//! │       │                                │ exec-0   │ │ exec-N   │  │
//! │       ▼                                │ tracked  │ │ tracked  │  │
//! │  AsyncResult ◀── promise.success ──────│ conn     │ │ conn     │  │
//! │   (Future + TaskControl)               └────┬─────┘ └────┬─────┘  │
//! │                                             └─────┬──────┘        │
//! └───────────────────────────────────────────────────┼───────────────┘
//!                                                     ▼
//!                                            SQLite (WAL) + ChangeBus
//! ```
//!
//! Workers share one receiver behind a mutex and compete for the next
//! message, so whichever worker is free picks up the next unit.
//!
//! ## Outcomes of a Unit
//!
//! | Unit result | Future | Error handler |
//! |-------------|--------|---------------|
//! | `Ok(outcome)` | success | no |
//! | `Err(Error::Rollback)` | success(`Absent`) | no |
//! | SQLite interrupt, or cancelled | nothing (debug log) | no |
//! | any other error, or a panic | failure | once |
//!
//! ## Cancellation
//!
//! [`AsyncResult::cancel`] cancels the future. A unit still in the queue is
//! skipped. A unit already running is interrupted at its next SQLite VM step
//! through the worker connection's progress handler, which turns into a
//! quiet cancellation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::future::{promise, Cancelable, Completion, Future, Promise};
use crate::outcome::Outcome;
use crate::plan::{ReadPlan, WritePlan};
use crate::pool::{PoolGuard, PooledUnit, UnitOutput, UnitPool};
use crate::route::Route;
use crate::store::{Store, TrackedConnection};
use crate::transaction::{with_transaction, Transaction};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of executor worker threads.
pub const DEFAULT_WORKERS: usize = 4;

/// Number of SQLite VM instructions between cancellation checks.
pub const PROGRESS_CHECK_OPS: i32 = 1_000;

/// Configuration for an [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker thread count. Zero is treated as one.
    pub workers: usize,
    /// Free units the pool keeps. `None` keeps one per worker.
    pub max_idle_units: Option<usize>,
    /// Worker thread name prefix; workers are named `<prefix>-<n>`.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_idle_units: None,
            thread_name: "livequery-exec".to_string(),
        }
    }
}

/// Callback invoked once for every operation fault.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

// =============================================================================
// Units
// =============================================================================

/// A unit of work run against a worker's connection.
pub trait ExecuteUnit<V>: Send + 'static {
    /// Runs the unit.
    fn run(self, conn: &Connection) -> Result<Outcome<V>>;
}

impl<V, F> ExecuteUnit<V> for F
where
    F: FnOnce(&Connection) -> Result<Outcome<V>> + Send + 'static,
{
    fn run(self, conn: &Connection) -> Result<Outcome<V>> {
        self(conn)
    }
}

// =============================================================================
// Task Control
// =============================================================================

enum TaskState {
    Queued,
    Running(Arc<AtomicBool>),
    Done,
    Cancelled,
}

/// Cancellation state shared between an [`AsyncResult`] and its worker.
struct TaskControl {
    state: Mutex<TaskState>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Queued),
        }
    }

    /// Moves to `Running`. Returns false if the task was cancelled first.
    fn begin(&self, interrupt: &Arc<AtomicBool>) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Queued => {
                interrupt.store(false, Ordering::SeqCst);
                *state = TaskState::Running(Arc::clone(interrupt));
                true
            }
            _ => false,
        }
    }

    /// Moves to `Done`. Returns false if the task was cancelled while running.
    fn finish(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Running(_) => {
                *state = TaskState::Done;
                true
            }
            _ => false,
        }
    }

    fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match &*state {
            TaskState::Queued => {
                *state = TaskState::Cancelled;
                true
            }
            TaskState::Running(interrupt) => {
                interrupt.store(true, Ordering::SeqCst);
                *state = TaskState::Cancelled;
                true
            }
            TaskState::Done | TaskState::Cancelled => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), TaskState::Cancelled)
    }
}

// =============================================================================
// AsyncResult
// =============================================================================

/// Handle on a submitted unit: its future plus the means to cancel it.
pub struct AsyncResult<V> {
    future: Future<Outcome<V>>,
    control: Arc<TaskControl>,
}

impl<V> Clone for AsyncResult<V> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            control: Arc::clone(&self.control),
        }
    }
}

impl<V: Clone + Send + 'static> AsyncResult<V> {
    /// A result that is already complete.
    fn ready(outcome: Outcome<V>) -> Self {
        let (promise, future) = promise();
        promise.success(outcome);
        let control = TaskControl::new();
        *control.state.lock() = TaskState::Done;
        Self {
            future,
            control: Arc::new(control),
        }
    }

    /// Registers a completion callback on `dispatcher`.
    ///
    /// See [`Future::on_complete`] for when the callback runs inline.
    pub fn on_complete<F>(&self, dispatcher: &Arc<dyn Dispatcher>, callback: F)
    where
        F: FnOnce(Completion<Outcome<V>>) + Send + 'static,
    {
        self.future.on_complete(dispatcher, callback);
    }

    /// Blocks until completion. Returns `None` on timeout or cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion<Outcome<V>>> {
        self.future.wait_timeout(timeout)
    }

    /// The completion, if already delivered.
    pub fn try_get(&self) -> Option<Completion<Outcome<V>>> {
        self.future.try_get()
    }

    /// Bridges into `std::future::Future`.
    pub fn into_async(self) -> impl std::future::Future<Output = Option<Completion<Outcome<V>>>> {
        self.future.into_async()
    }

    /// The underlying future.
    pub fn future(&self) -> &Future<Outcome<V>> {
        &self.future
    }

    /// True once a value or an error was delivered.
    pub fn is_complete(&self) -> bool {
        self.future.is_complete()
    }

    /// True if the unit was cancelled before completing.
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled() || self.future.is_cancelled()
    }
}

impl<V: Clone + Send + 'static> Cancelable for AsyncResult<V> {
    fn cancel(&self) {
        self.control.cancel();
        self.future.cancel();
    }
}

// =============================================================================
// Workers
// =============================================================================

struct WorkerSlot {
    conn: TrackedConnection,
    interrupt: Arc<AtomicBool>,
}

/// A queued unit. `None` means the context shut down before it ran.
type Job = Box<dyn FnOnce(Option<&WorkerSlot>) + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

struct ContextShared {
    handler: RwLock<Option<ErrorHandler>>,
}

impl ContextShared {
    fn report(&self, error: &Error) {
        let Some(handler) = self.handler.read().clone() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
            error!("error handler panicked");
        }
    }
}

fn run_worker(slot: WorkerSlot, rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>) {
    loop {
        // Whichever worker holds the lock takes the next message.
        let message = { rx.lock().blocking_recv() };
        match message {
            Some(Message::Run(job)) => job(Some(&slot)),
            Some(Message::Shutdown) | None => break,
        }
    }
}

/// Runs one unit on a worker and settles its promise.
fn execute<V, U>(
    slot: Option<&WorkerSlot>,
    unit: U,
    promise: &Promise<Outcome<V>>,
    control: &TaskControl,
    shared: &ContextShared,
) where
    V: Clone + Send + 'static,
    U: ExecuteUnit<V>,
{
    let Some(slot) = slot else {
        promise.failure(Arc::new(Error::ExecutorShutdown));
        return;
    };

    if !control.begin(&slot.interrupt) {
        debug!("unit cancelled before it ran");
        return;
    }

    let conn = slot.conn.connection();
    let result = panic::catch_unwind(AssertUnwindSafe(|| unit.run(conn)))
        .unwrap_or_else(|payload| Err(Error::from_panic(payload)));

    // Once the task leaves `Running`, cancel() no longer touches the flag,
    // so clearing it here keeps the cleanup statements uninterruptible.
    let cancelled = !control.finish();
    slot.interrupt.store(false, Ordering::SeqCst);

    if !conn.is_autocommit() {
        warn!("unit left a transaction open; rolling back");
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback of abandoned transaction failed");
        }
    }
    slot.conn.flush_changes();

    match result {
        Ok(outcome) if !cancelled => {
            promise.success(outcome);
        }
        Err(e) if e.is_rollback() && !cancelled => {
            promise.success(Outcome::Absent);
        }
        Ok(_) => debug!("unit cancelled while running; result dropped"),
        Err(e) if cancelled || e.is_interrupt() || e.is_rollback() => {
            debug!(error = %e, "unit cancelled");
        }
        Err(e) => {
            let error = Arc::new(e);
            if promise.failure(Arc::clone(&error)) {
                shared.report(&error);
            }
        }
    }
}

// =============================================================================
// Execution Context
// =============================================================================

/// A fixed pool of worker threads running database units.
pub struct ExecutionContext {
    store: Store,
    pool: Arc<UnitPool>,
    shared: Arc<ContextShared>,
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    closed: AtomicBool,
}

impl ExecutionContext {
    /// Opens one read-write connection per worker and starts the workers.
    pub fn new(store: Store, config: ExecutorConfig) -> Result<Self> {
        let worker_count = config.workers.max(1);
        let pool = UnitPool::new(config.max_idle_units.unwrap_or(worker_count));

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let conn = store.connect()?;
            let interrupt = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&interrupt);
            conn.progress_handler(
                PROGRESS_CHECK_OPS,
                Some(move || flag.load(Ordering::Relaxed)),
            );

            let slot = WorkerSlot { conn, interrupt };
            let worker_rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, i))
                .spawn(move || run_worker(slot, worker_rx))
                .map_err(|e| Error::WorkerUnavailable(format!("executor thread: {}", e)))?;
            handles.push(handle);
        }

        debug!(workers = worker_count, "execution context started");

        Ok(Self {
            store,
            pool,
            shared: Arc::new(ContextShared {
                handler: RwLock::new(None),
            }),
            tx,
            rx,
            handles: Mutex::new(handles),
            worker_count,
            closed: AtomicBool::new(false),
        })
    }

    /// Queues `unit` and returns immediately.
    pub fn submit<V, U>(&self, unit: U) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
        U: ExecuteUnit<V>,
    {
        let (promise, future) = promise::<Outcome<V>>();
        let control = Arc::new(TaskControl::new());

        if self.closed.load(Ordering::Acquire) {
            promise.failure(Arc::new(Error::ExecutorShutdown));
            return AsyncResult { future, control };
        }

        let job_promise = promise.clone();
        let job_control = Arc::clone(&control);
        let shared = Arc::clone(&self.shared);
        let job: Job = Box::new(move |slot: Option<&WorkerSlot>| {
            execute(slot, unit, &job_promise, &job_control, &shared);
        });

        if self.tx.send(Message::Run(job)).is_err() {
            promise.failure(Arc::new(Error::ExecutorShutdown));
        }

        AsyncResult { future, control }
    }

    fn run_pooled<V, M>(&self, unit: PoolGuard, map: M) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
        M: FnOnce(UnitOutput) -> Outcome<V> + Send + 'static,
    {
        self.submit(move |conn: &Connection| {
            let mut unit = unit;
            let output = unit.run(conn)?;
            drop(unit);
            Ok(output.and_then(map))
        })
    }

    fn stamped(&self, init: impl FnOnce(&mut PooledUnit)) -> PoolGuard {
        let mut unit = self.pool.acquire();
        init(&mut unit);
        unit
    }

    /// Checks whether the route selects any row.
    pub fn exists(&self, route: Route) -> AsyncResult<bool> {
        let unit = self.stamped(|u| {
            u.init_exists(route);
        });
        self.run_pooled(unit, |output| match output {
            UnitOutput::Exists(found) => Outcome::Value(found),
            _ => Outcome::Absent,
        })
    }

    /// Inserts a row. Completes with its rowid, or `Absent` for an empty plan.
    pub fn insert(&self, route: Route, plan: Arc<dyn WritePlan>) -> AsyncResult<i64> {
        let unit = self.stamped(|u| {
            u.init_insert(route, plan);
        });
        self.run_pooled(unit, |output| match output {
            UnitOutput::Inserted(rowid) => Outcome::Value(rowid),
            _ => Outcome::Absent,
        })
    }

    /// Updates the routed rows. Completes with the number of rows changed.
    pub fn update(&self, route: Route, plan: Arc<dyn WritePlan>) -> AsyncResult<usize> {
        let unit = self.stamped(|u| {
            u.init_update(route, plan);
        });
        self.run_pooled(unit, |output| match output {
            UnitOutput::Changed(n) => Outcome::Value(n),
            _ => Outcome::Absent,
        })
    }

    /// Deletes the routed rows. Completes with the number of rows deleted.
    pub fn delete(&self, route: Route) -> AsyncResult<usize> {
        let unit = self.stamped(|u| {
            u.init_delete(route);
        });
        self.run_pooled(unit, |output| match output {
            UnitOutput::Changed(n) => Outcome::Value(n),
            _ => Outcome::Absent,
        })
    }

    /// Reads the routed rows through `plan`.
    ///
    /// A single-row route that selects nothing completes with `Absent`
    /// without consulting the plan.
    pub fn query<V>(&self, route: Route, plan: Arc<dyn ReadPlan<V>>) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
    {
        if plan.is_empty() {
            return AsyncResult::ready(Outcome::Absent);
        }

        let single_row = route.is_single_row();
        let unit = self.stamped(|u| {
            u.init_query(route, plan.projection());
        });

        self.submit(move |conn: &Connection| {
            let mut unit = unit;
            let output = unit.run(conn)?;
            // The unit goes back to the pool before the plan materializes.
            drop(unit);

            Ok(match output {
                Outcome::Value(UnitOutput::Rows(rows)) => {
                    if rows.is_empty() && single_row {
                        Outcome::Absent
                    } else {
                        plan.read(rows).get()
                    }
                }
                _ => Outcome::Absent,
            })
        })
    }

    /// Runs `block` in a `BEGIN IMMEDIATE` transaction on a worker.
    ///
    /// The block may open savepoints through [`Transaction::savepoint`].
    /// Returning [`Error::Rollback`] rolls the transaction back and completes
    /// with `Absent`.
    pub fn transaction<V, F>(&self, block: F) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<Outcome<V>> + Send + 'static,
    {
        self.submit(move |conn: &Connection| {
            Ok(with_transaction(conn, block)?.unwrap_or(Outcome::Absent))
        })
    }

    /// Installs or removes the error handler.
    ///
    /// A fault is reported to whichever handler is installed when it happens.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        *self.shared.handler.write() = handler;
    }

    /// Removes the error handler.
    pub fn clear_error_handler(&self) {
        self.set_error_handler(None);
    }

    /// The unit pool.
    pub fn pool(&self) -> &Arc<UnitPool> {
        &self.pool
    }

    /// The store the workers write to.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stops the workers after the units already queued.
    ///
    /// Units still queued behind the shutdown complete with
    /// [`Error::ExecutorShutdown`]. Later submissions fail the same way.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for _ in 0..self.worker_count {
            let _ = self.tx.send(Message::Shutdown);
        }

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            // A callback on a worker may drop the last handle to the context.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("executor worker panicked during shutdown");
            }
        }

        let mut stops = 0;
        {
            let mut rx = self.rx.lock();
            while let Ok(message) = rx.try_recv() {
                match message {
                    Message::Run(job) => job(None),
                    Message::Shutdown => stops += 1,
                }
            }
        }
        // Stop messages still owed to a worker that was not joined.
        for _ in 0..stops {
            let _ = self.tx.send(Message::Shutdown);
        }

        debug!("execution context shut down");
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
