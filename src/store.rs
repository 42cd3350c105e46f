//! # SQLite Store
//!
//! The [`Store`] is the local relational database plus its change bus. It
//! hands out two kinds of connections:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Store                                  │
//! │                                                                     │
//! │  connect()  ──▶ TrackedConnection (read-write, executor workers)    │
//! │                 update_hook  → pending changes                      │
//! │                 rollback_hook → discard pending                     │
//! │                 flush_changes → publish once back in autocommit     │
//! │                                                                     │
//! │  connect_read_only() ──▶ Connection (watcher workers)               │
//! │                                                                     │
//! │  bus() ──▶ ChangeBus                                                │
//! └──────────────────────────────┬─────────────────────────────────────┘
//!                                ▼
//!                        ┌───────────────┐
//!                        │ SQLite (WAL)  │
//!                        └───────────────┘
//! ```
//!
//! ## Why WAL?
//!
//! Watchers re-read on their own read-only connections while executor
//! workers write. WAL lets those reads proceed without blocking the writer
//! and guarantees that a read started after a commit sees it.
//!
//! ## In-Memory Databases
//!
//! Each connection to `:memory:` is a separate database, so the store always
//! works on a file. Tests use a temporary directory.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::bus::{Change, ChangeBus};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Default time a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a statement waits for a lock held by another connection.
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

struct StoreShared {
    path: PathBuf,
    config: StoreConfig,
    bus: ChangeBus,
}

/// A SQLite database file together with its change bus.
///
/// Cloning gives another handle to the same store.
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if needed) the database at `path` and switches it to
    /// WAL mode.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;

        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(Error::Schema(format!(
                "could not enable WAL mode for {} (got '{}')",
                path.display(),
                mode
            )));
        }

        debug!(path = %path.display(), "store opened");

        Ok(Self {
            shared: Arc::new(StoreShared {
                path,
                config,
                bus: ChangeBus::new(),
            }),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The change bus fed by this store's tracked connections.
    pub fn bus(&self) -> &ChangeBus {
        &self.shared.bus
    }

    /// Opens a read-write connection whose committed changes are published
    /// to the bus on [`TrackedConnection::flush_changes`].
    pub fn connect(&self) -> Result<TrackedConnection> {
        let conn = Connection::open_with_flags(
            &self.shared.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.shared.config.busy_timeout)?;

        let pending: Arc<Mutex<Vec<Change>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = Arc::clone(&pending);
        conn.update_hook(Some(
            move |_action, _db: &str, table: &str, rowid: i64| {
                let mut pending = recorder.lock();
                let duplicate = pending
                    .last()
                    .is_some_and(|last| last.rowid == Some(rowid) && &*last.table == table);
                if !duplicate {
                    pending.push(Change::row(table, rowid));
                }
            },
        ));

        let discard = Arc::clone(&pending);
        conn.rollback_hook(Some(move || discard.lock().clear()));

        Ok(TrackedConnection {
            conn,
            pending,
            bus: self.shared.bus.clone(),
        })
    }

    /// Opens a read-only connection.
    pub fn connect_read_only(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.shared.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.shared.config.busy_timeout)?;
        Ok(conn)
    }

    /// Runs a batch of SQL on a tracked connection and publishes the changes.
    ///
    /// Intended for schema setup and fixtures; regular writes go through the
    /// execution context.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(sql)?;
        conn.flush_changes();
        Ok(())
    }
}

// =============================================================================
// Tracked Connection
// =============================================================================

/// A read-write connection that records row changes for the bus.
pub struct TrackedConnection {
    conn: Connection,
    pending: Arc<Mutex<Vec<Change>>>,
    bus: ChangeBus,
}

impl TrackedConnection {
    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Publishes recorded changes if no transaction is open.
    ///
    /// Returns the number of changes published. Inside an open transaction
    /// the changes stay pending until a later call after commit.
    pub fn flush_changes(&self) -> usize {
        if !self.conn.is_autocommit() {
            return 0;
        }
        let changes = std::mem::take(&mut *self.pending.lock());
        let count = changes.len();
        if count > 0 {
            self.bus.publish(changes);
        }
        count
    }

    /// Number of recorded, unpublished changes.
    pub fn pending_changes(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Deref for TrackedConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}
