//! # Error Handling for livequery
//!
//! This module defines the error types used throughout livequery. A single
//! error enum ([`Error`]) represents every failure mode, which keeps the
//! signatures of the executor, session, and watcher APIs uniform.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From<rusqlite::Error>` comes from `#[from]`, so `?` converts for us
//!
//! ## Error Categories
//!
//! | Category | Variants | Where it surfaces |
//! |----------|----------|-------------------|
//! | Operation fault | `Sqlite`, `AmbiguousRoute`, `Panicked` | `Future` failure + `ErrorHandler` |
//! | Rollback signal | `Rollback` | Never surfaces; becomes "no value" |
//! | Lifecycle misuse | `SessionStopped`, `WatcherAlreadyRunning` | Returned synchronously |
//! | Watcher fault | `UnknownResource` | `WatchListener::on_error` |
//! | Infrastructure | `Schema`, `ExecutorShutdown`, `WorkerUnavailable` | Returned from constructors |
//!
//! Interruption of a running unit is not an error at all: it is quiet
//! cancellation and is only ever logged. [`Error::is_interrupt`] is how the
//! executor tells the two apart.

use std::any::Any;

use rusqlite::ErrorCode;
use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in livequery operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Operation Faults
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// This wraps any error from the `rusqlite` crate: a locked database that
    /// outlived the busy timeout, a constraint violation, a malformed
    /// statement, or an interrupted statement (see [`Error::is_interrupt`]).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A single-row route matched more than one row during a write.
    ///
    /// The write is rolled back before this error is returned, so no row
    /// is modified.
    #[error("route on table '{table}' addresses one row, but {rows} rows matched")]
    AmbiguousRoute {
        /// Table the route points at.
        table: String,
        /// Number of rows the statement touched before being rolled back.
        rows: usize,
    },

    /// A unit of work panicked on its worker thread.
    #[error("unit panicked: {0}")]
    Panicked(String),

    // =========================================================================
    // Control Transfer
    // =========================================================================

    /// Request to roll back the innermost savepoint.
    ///
    /// Returning this from a savepoint block is the expected way to abandon
    /// the statements issued inside it. It is never reported to an
    /// `ErrorHandler`.
    #[error("rollback requested")]
    Rollback,

    // =========================================================================
    // Lifecycle Misuse (programming bugs)
    // =========================================================================

    /// The session was stopped; it cannot be started, paused, or given new
    /// watchers.
    #[error("session is stopped")]
    SessionStopped,

    /// `start` was called on a watcher whose loop is already running.
    #[error("watcher {watcher} is already running")]
    WatcherAlreadyRunning {
        /// Identifier of the watcher within its session.
        watcher: u64,
    },

    // =========================================================================
    // Watcher Faults
    // =========================================================================

    /// A route refers to a table the store does not know about.
    #[error("unknown resource: no table named '{table}'")]
    UnknownResource {
        /// The table name that failed to resolve.
        table: String,
    },

    // =========================================================================
    // Infrastructure
    // =========================================================================

    /// Store initialization or verification failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// The execution context has been shut down and accepts no more work.
    #[error("execution context has shut down")]
    ExecutorShutdown,

    /// A background worker could not be created.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl Error {
    /// Returns true if this error is SQLite reporting an interrupted statement.
    ///
    /// The executor treats such errors as quiet cancellation.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::OperationInterrupted
        )
    }

    /// Returns true for the savepoint rollback signal.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback)
    }

    /// Builds [`Error::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Error::Panicked(message)
    }

    /// Returns true for errors caused by misusing a session or watcher.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::SessionStopped | Error::WatcherAlreadyRunning { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the rollback signal.
///
/// Convenience for savepoint blocks: `return rollback();`.
pub fn rollback<T>() -> Result<T> {
    Err(Error::Rollback)
}

// =============================================================================
// Tests
// =============================================================================
