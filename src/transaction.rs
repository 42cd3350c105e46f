//! # Transactions and Savepoints
//!
//! A unit of work that needs atomicity runs inside a top-level transaction
//! and may carve nested units out of it with SAVEPOINTs:
//!
//! ```text
//! BEGIN IMMEDIATE
//!   INSERT ...                     ← kept
//!   SAVEPOINT sp_1_1
//!     INSERT ...                   ┐
//!     SAVEPOINT sp_2_2             │ block returns Err(Error::Rollback)
//!       UPDATE ...                 │   → ROLLBACK TO sp_1_1; RELEASE sp_1_1
//!     RELEASE sp_2_2               ┘
//!   INSERT ...                     ← kept, transaction still open
//! COMMIT
//! ```
//!
//! ## SAVEPOINT Semantics
//!
//! - Block succeeds: the savepoint is released and its changes stay.
//! - Block returns [`Error::Rollback`]: everything since the savepoint is
//!   undone, the savepoint is released, and the caller gets `Ok(None)`. The
//!   enclosing transaction is untouched.
//! - Block fails otherwise: same rollback, and the error propagates.
//! - A savepoint that is begun but never run is rolled back on drop.
//!
//! Savepoint names are `sp_<depth>_<seq>`, where `seq` counts every savepoint
//! of the transaction, so names never repeat within one transaction.
//!
//! [`Error::Rollback`]: crate::Error::Rollback

use std::cell::Cell;

use rusqlite::{Connection, Params, Row};
use tracing::warn;

use crate::error::Result;

// =============================================================================
// Transaction
// =============================================================================

/// A connection inside an open transaction, at some savepoint depth.
pub struct Transaction<'a> {
    conn: &'a Connection,
    depth: usize,
    sequence: &'a Cell<u64>,
}

impl<'a> Transaction<'a> {
    /// The underlying connection.
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Savepoint nesting depth; 0 for the top-level transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Executes one statement. Returns the number of rows changed.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Runs a query expected to return one row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f)?)
    }

    /// Runs `block` inside a new savepoint.
    ///
    /// Returns `Ok(None)` if the block asked for a rollback.
    pub fn savepoint<T, F>(&self, block: F) -> Result<Option<T>>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        SavepointTransaction::begin(self)?.run(block)
    }
}

// =============================================================================
// Savepoint
// =============================================================================

/// A nested unit of work inside a [`Transaction`].
pub struct SavepointTransaction<'a> {
    conn: &'a Connection,
    name: String,
    depth: usize,
    sequence: &'a Cell<u64>,
    finished: bool,
}

impl<'a> SavepointTransaction<'a> {
    /// Issues `SAVEPOINT` on the parent's connection.
    pub fn begin(parent: &Transaction<'a>) -> Result<Self> {
        let seq = parent.sequence.get() + 1;
        parent.sequence.set(seq);

        let depth = parent.depth + 1;
        let name = format!("sp_{}_{}", depth, seq);
        parent.conn.execute_batch(&format!("SAVEPOINT {}", name))?;

        Ok(Self {
            conn: parent.conn,
            name,
            depth,
            sequence: parent.sequence,
            finished: false,
        })
    }

    /// The generated savepoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `block` against the savepoint and releases or rolls it back.
    pub fn run<T, F>(mut self, block: F) -> Result<Option<T>>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let nested = Transaction {
            conn: self.conn,
            depth: self.depth,
            sequence: self.sequence,
        };
        let result = block(&nested);
        self.finished = true;

        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
                Ok(Some(value))
            }
            Err(e) if e.is_rollback() => {
                self.rollback()?;
                Ok(None)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(savepoint = %self.name, error = %rollback_err, "savepoint rollback failed");
                }
                Err(e)
            }
        }
    }

    fn rollback(&self) -> Result<()> {
        // A failed statement can end the whole transaction, taking the
        // savepoint with it.
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "ROLLBACK TO {name}; RELEASE {name}",
            name = self.name
        ))?;
        Ok(())
    }
}

impl Drop for SavepointTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.rollback() {
                warn!(savepoint = %self.name, error = %e, "rollback of abandoned savepoint failed");
            }
        }
    }
}

// =============================================================================
// Top-Level Transaction
// =============================================================================

/// Runs `block` in a `BEGIN IMMEDIATE` transaction and commits it.
///
/// Returns `Ok(None)` and rolls back if the block returned
/// [`Error::Rollback`](crate::Error::Rollback). Any other error rolls back and
/// propagates.
pub fn with_transaction<T, F>(conn: &Connection, block: F) -> Result<Option<T>>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;

    let sequence = Cell::new(0);
    let tx = Transaction {
        conn,
        depth: 0,
        sequence: &sequence,
    };

    match block(&tx) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(Some(value)),
            Err(e) => {
                rollback_quietly(conn);
                Err(e.into())
            }
        },
        Err(e) if e.is_rollback() => {
            rollback_quietly(conn);
            Ok(None)
        }
        Err(e) => {
            rollback_quietly(conn);
            Err(e)
        }
    }
}

fn rollback_quietly(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        warn!(error = %e, "transaction rollback failed");
    }
}
