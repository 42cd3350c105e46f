//! # LiveStore Facade
//!
//! [`LiveStore`] wires the pieces together for one data-access object: a
//! [`Store`], an [`ExecutionContext`] writing to it, and a [`Session`] whose
//! watchers read from it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               LiveStore                                  │
//! │                                                                          │
//! │   insert/update/delete/query/transaction        watch(route, plan, ...)  │
//! │                 │                                        │               │
//! │                 ▼                                        ▼               │
//! │   ┌───────────────────────────┐             ┌─────────────────────────┐  │
//! │   │     ExecutionContext      │             │         Session         │  │
//! │   │  N workers, R/W conns     │             │  watchers on workers    │  │
//! │   │  update_hook ─────────────┼── bus ─────▶│  picked by the strategy │  │
//! │   └─────────────┬─────────────┘             └────────────┬────────────┘  │
//! └─────────────────┼────────────────────────────────────────┼───────────────┘
//!                   └─────────────────┬──────────────────────┘
//!                                     ▼
//!                             ┌─────────────┐
//!                             │   SQLite    │
//!                             │   (WAL)     │
//!                             └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use livequery::{
//!     inline, FnReadPlan, LiveConfig, LiveStore, Outcome, Projection, Route, Rows,
//!     ValuesWritePlan,
//! };
//!
//! let live = LiveStore::open("notes.db", LiveConfig::default())?;
//! live.execute_batch("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, title TEXT)")?;
//!
//! let count = Arc::new(FnReadPlan::new(Projection::All, |rows: &Rows| Outcome::Value(rows.len())));
//! let _subscription = live.watch(Route::table("notes"), "notes", count, listener, inline())?;
//! live.start()?;
//!
//! live.insert(Route::table("notes"), Arc::new(ValuesWritePlan::new().set("title", "hi".to_string())));
//! ```

use std::path::Path;
use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::executor::{AsyncResult, ErrorHandler, ExecuteUnit, ExecutionContext, ExecutorConfig};
use crate::outcome::Outcome;
use crate::plan::{ReadPlan, WritePlan};
use crate::route::{Resource, Route};
use crate::session::{Session, SessionState, Subscription};
use crate::store::{Store, StoreConfig};
use crate::strategy::DispatchPolicy;
use crate::transaction::Transaction;
use crate::watcher::{Watch, WatchListener};

// =============================================================================
// Configuration
// =============================================================================

/// Everything needed to open a [`LiveStore`].
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    /// Database settings.
    pub store: StoreConfig,
    /// Executor pool settings.
    pub executor: ExecutorConfig,
    /// Where watcher loops run.
    pub dispatch: DispatchPolicy,
}

// =============================================================================
// LiveStore
// =============================================================================

/// A store, its execution context, and one subscription session.
///
/// Dropping it stops every watcher and shuts the executor down.
pub struct LiveStore {
    session: Session,
    context: Arc<ExecutionContext>,
    store: Store,
}

impl LiveStore {
    /// Opens the database at `path` and starts the executor.
    ///
    /// The session starts out `Initialized`; call [`start`](Self::start) to
    /// run watchers.
    pub fn open(path: impl AsRef<Path>, config: LiveConfig) -> Result<Self> {
        let store = Store::open(path, config.store)?;
        let context = Arc::new(ExecutionContext::new(store.clone(), config.executor)?);
        let strategy = config.dispatch.build(&store);
        let session = Session::with_context(Arc::clone(&context), strategy);

        Ok(Self {
            session,
            context,
            store,
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The execution context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// The subscription session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Applies DDL or fixtures synchronously, notifying watchers of any rows
    /// it changes.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.store.execute_batch(sql)
    }

    // =========================================================================
    // One-shot Operations
    // =========================================================================

    /// See [`ExecutionContext::submit`].
    pub fn submit<V, U>(&self, unit: U) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
        U: ExecuteUnit<V>,
    {
        self.context.submit(unit)
    }

    /// See [`ExecutionContext::exists`].
    pub fn exists(&self, route: Route) -> AsyncResult<bool> {
        self.context.exists(route)
    }

    /// See [`ExecutionContext::insert`].
    pub fn insert(&self, route: Route, plan: Arc<dyn WritePlan>) -> AsyncResult<i64> {
        self.context.insert(route, plan)
    }

    /// See [`ExecutionContext::update`].
    pub fn update(&self, route: Route, plan: Arc<dyn WritePlan>) -> AsyncResult<usize> {
        self.context.update(route, plan)
    }

    /// See [`ExecutionContext::delete`].
    pub fn delete(&self, route: Route) -> AsyncResult<usize> {
        self.context.delete(route)
    }

    /// See [`ExecutionContext::query`].
    pub fn query<V>(&self, route: Route, plan: Arc<dyn ReadPlan<V>>) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
    {
        self.context.query(route, plan)
    }

    /// See [`ExecutionContext::transaction`].
    pub fn transaction<V, F>(&self, block: F) -> AsyncResult<V>
    where
        V: Clone + Send + 'static,
        F: FnOnce(&Transaction<'_>) -> Result<Outcome<V>> + Send + 'static,
    {
        self.context.transaction(block)
    }

    /// Installs or removes the handler told about operation faults.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        self.context.set_error_handler(handler);
    }

    // =========================================================================
    // Live Queries
    // =========================================================================

    /// Watches `route` through `plan`; results go to `listener` on
    /// `dispatcher`.
    pub fn watch<V: Send + 'static>(
        &self,
        route: Route,
        resource: impl Into<Resource>,
        plan: Arc<dyn ReadPlan<V>>,
        listener: Arc<dyn WatchListener<V>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Subscription> {
        self.session
            .submit(route, resource, Watch::new(plan, listener, dispatcher))
    }

    /// See [`Session::start`].
    pub fn start(&self) -> Result<()> {
        self.session.start()
    }

    /// See [`Session::pause`].
    pub fn pause(&self) -> Result<()> {
        self.session.pause()
    }

    /// See [`Session::stop`].
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Stops the session and the executor.
    pub fn shutdown(&self) {
        self.session.stop();
        self.context.shutdown();
    }
}
