//! # Watcher Workers
//!
//! A [`Worker`] is one dedicated OS thread driving a current-thread Tokio
//! runtime and a `LocalSet`. It owns one read-only SQLite connection; every
//! watcher loop leased onto the worker runs as a local task sharing it.
//!
//! ```text
//!  Worker::execute(job) ──▶ mpsc ──▶ ┌──────────────────────────────────┐
//!                                    │ thread "livequery-watch-3"       │
//!                                    │  LocalSet                        │
//!                                    │   ├─ watcher loop A  ┐           │
//!                                    │   ├─ watcher loop B  ├─ Rc<Conn> │
//!                                    │   └─ watcher loop C  ┘           │
//!                                    └──────────────────────────────────┘
//! ```
//!
//! Loops only block the thread while a read runs; otherwise they are parked
//! on their token channel. Dropping the last handle to a worker closes its
//! queue, which ends the thread and every loop still on it.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use futures::future::LocalBoxFuture;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;

/// A job spawned as a local task on a worker.
pub type LoopJob = Box<dyn FnOnce(Rc<Connection>) -> LocalBoxFuture<'static, ()> + Send + 'static>;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// A dedicated watcher thread. See the module docs.
pub struct Worker {
    id: u64,
    name: String,
    thread_id: thread::ThreadId,
    tx: mpsc::UnboundedSender<LoopJob>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Worker {
    /// Opens a read-only connection and starts the worker thread.
    pub fn spawn(store: &Store, name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);

        let conn = store.connect_read_only()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::WorkerUnavailable(format!("worker runtime: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LoopJob>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let conn = Rc::new(conn);
                let local = LocalSet::new();
                local.block_on(&rt, async move {
                    while let Some(job) = rx.recv().await {
                        tokio::task::spawn_local(job(Rc::clone(&conn)));
                    }
                });
                debug!(worker = %thread_name, "worker stopped");
            })
            .map_err(|e| Error::WorkerUnavailable(format!("worker thread: {}", e)))?;

        debug!(worker = %name, id, "worker started");

        Ok(Arc::new(Self {
            id,
            name,
            thread_id: handle.thread().id(),
            tx,
        }))
    }

    /// Process-wide unique worker id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the worker thread.
    pub fn thread_id(&self) -> thread::ThreadId {
        self.thread_id
    }

    /// Spawns `job` as a local task on the worker.
    pub fn execute(&self, job: LoopJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| Error::WorkerUnavailable(format!("worker {} has stopped", self.name)))
    }
}
