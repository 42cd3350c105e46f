//! # Dispatchers
//!
//! A [`Dispatcher`] decides which thread runs a completion callback. The engine
//! never guesses: every callback registration names its dispatcher, and
//! watcher results are always handed to the dispatcher the caller supplied.
//!
//! - [`Inline`] runs the task on whatever thread completes the work.
//! - [`ThreadDispatcher`] owns one dedicated thread and runs tasks in FIFO
//!   order. This is the stand-in for a UI or main loop.
//! - [`TokioDispatcher`] spawns tasks onto a Tokio runtime.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// A unit of callback work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs callback tasks on some execution resource.
pub trait Dispatcher: Send + Sync {
    /// Schedules `task` to run. Must not block waiting for it.
    fn dispatch(&self, task: Task);
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(&self, task: Task) {
        (**self).dispatch(task)
    }
}

// =============================================================================
// Inline
// =============================================================================

/// Runs tasks synchronously on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Dispatcher for Inline {
    fn dispatch(&self, task: Task) {
        task()
    }
}

/// Returns a shared [`Inline`] dispatcher.
pub fn inline() -> Arc<dyn Dispatcher> {
    Arc::new(Inline)
}

// =============================================================================
// Dedicated Thread
// =============================================================================

/// A single-threaded dispatcher backed by its own OS thread.
///
/// Tasks run one at a time in submission order. Dropping the dispatcher
/// lets the thread drain the queue and exit.
#[derive(Debug)]
pub struct ThreadDispatcher {
    tx: Mutex<Sender<Task>>,
    thread_id: thread::ThreadId,
}

impl ThreadDispatcher {
    /// Spawns the dispatcher thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .map_err(|e| Error::WorkerUnavailable(format!("dispatcher thread: {}", e)))?;

        Ok(Self {
            tx: Mutex::new(tx),
            thread_id: handle.thread().id(),
        })
    }

    /// Identifier of the dispatcher thread.
    pub fn thread_id(&self) -> thread::ThreadId {
        self.thread_id
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, task: Task) {
        if self.tx.lock().send(task).is_err() {
            warn!("dispatcher thread has exited; dropping task");
        }
    }
}

// =============================================================================
// Tokio
// =============================================================================

/// Spawns tasks onto a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    /// Dispatches onto the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Dispatches onto the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}
