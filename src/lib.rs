//! # livequery - Live Queries over SQLite
//!
//! livequery is a data-access layer over a local SQLite database. It provides:
//!
//! - **Non-blocking operations**: every read and write runs on a worker pool
//!   and completes a future
//! - **Live queries**: watchers re-run a read plan whenever the rows behind
//!   it change, coalescing bursts of changes into one re-run
//! - **Pluggable isolation**: a dispatch strategy decides which thread each
//!   watcher runs on
//! - **Nested units of work**: savepoints inside a transaction roll back
//!   independently
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          LiveStore                              │
//! │            (insert, update, query, watch, start/stop)           │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────────┐
//! │       ExecutionContext        │ │            Session            │
//! │  worker pool + pooled units   │ │  state machine + watchers     │
//! │  Future/Promise results       │ │  DispatchStrategy → Workers   │
//! └───────────────┬───────────────┘ └───────────────▲───────────────┘
//!                 │ commit                          │ tokens
//!                 ▼                                 │
//! ┌─────────────────────────────────────────────────┴───────────────┐
//! │                  Store (SQLite WAL) + ChangeBus                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single delivery**: a future completes at most once; late callbacks
//!    still see the value
//! 2. **Quiet cancellation**: an interrupted or cancelled unit never reports
//!    an error
//! 3. **Session atomicity**: state transitions and registry changes happen
//!    under one lock
//! 4. **Coalescing**: changes during a watcher run cause exactly one more run
//! 5. **Rollback scope**: a savepoint rollback only undoes its own statements
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and `Result` alias
//! - [`outcome`]: The tri-state `Outcome` payload
//! - [`dispatch`]: Callback dispatchers
//! - [`future`]: Single-assignment futures and promises
//! - [`route`], [`plan`]: Addressing and plan traits
//! - [`store`], [`bus`], [`statement`]: SQLite access and change tracking
//! - [`pool`], [`executor`], [`transaction`]: One-shot execution
//! - [`worker`], [`strategy`], [`watcher`], [`session`]: Live queries
//! - [`api`]: The [`LiveStore`] facade

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for livequery operations.
pub mod error;

/// Tri-state result payload.
pub mod outcome;

/// Dispatchers that decide where callbacks run.
pub mod dispatch;

/// Futures and promises with dispatcher-aware callbacks.
pub mod future;

/// Resources and physical routes.
pub mod route;

/// Read and write plan traits plus simple adapters.
pub mod plan;

/// Change notification bus with per-subscriber coalescing.
pub mod bus;

/// The SQLite store and its tracked connections.
pub mod store;

/// SQL builders for route-addressed statements.
pub mod statement;

/// Transactions and savepoints.
pub mod transaction;

/// Reusable pooled units.
pub mod pool;

/// The execution context: a worker pool running database units.
///
/// The main entry point for one-shot work is
/// [`ExecutionContext`](executor::ExecutionContext).
pub mod executor;

/// Dedicated watcher threads.
pub mod worker;

/// Dispatch strategies mapping watchers to workers.
pub mod strategy;

/// Live query watchers.
pub mod watcher;

/// Subscription sessions.
pub mod session;

/// The `LiveStore` facade.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{LiveConfig, LiveStore};
pub use bus::{Change, ChangeBus};
pub use dispatch::{inline, Dispatcher, Inline, ThreadDispatcher, TokioDispatcher};
pub use error::{rollback, Error, Result};
pub use executor::{AsyncResult, ErrorHandler, ExecuteUnit, ExecutionContext, ExecutorConfig};
pub use future::{promise, Cancelable, Completion, Future, Promise};
pub use outcome::Outcome;
pub use plan::{
    ColumnValues, FnReadPlan, Producer, Projection, ReadPlan, Rows, ValuesWritePlan, WriteOp,
    WritePlan,
};
pub use route::{Resource, Route, Selection};
pub use session::{Session, SessionState, Subscription};
pub use store::{Store, StoreConfig};
pub use strategy::{DispatchPolicy, DispatchStrategy};
pub use transaction::{SavepointTransaction, Transaction};
pub use watcher::{ChangeWatcher, Watch, WatchListener};

// Re-export the SQLite value type so callers can build plans without a
// direct rusqlite dependency.
pub use rusqlite::types::Value;
