//! # Futures and Promises
//!
//! A single-assignment asynchronous cell split into a write side
//! ([`Promise`]) and a read side ([`Future`]).
//!
//! ```text
//!   producer (worker thread)          consumers (any thread)
//!   ┌──────────────────────┐          ┌──────────────────────────────┐
//!   │ promise.success(v)   │──┐   ┌──▶│ on_complete(dispatcher, cb)  │
//!   │ promise.failure(e)   │  │   │   │ wait_timeout(d)              │
//!   └──────────────────────┘  ▼   │   │ into_async().await           │
//!                        ┌────────┴─┐ └──────────────────────────────┘
//!                        │   Slot   │  Pending(waiters) → Complete(c)
//!                        └──────────┘                   ↘ Cancelled
//! ```
//!
//! ## Delivery Rules
//!
//! - The first `success`/`failure` wins; every later attempt returns `false`
//!   and changes nothing.
//! - Callbacks registered before completion run on their own dispatcher.
//! - Callbacks registered after completion run immediately on the calling
//!   thread. This avoids a dispatcher hop racing the completion.
//! - Cancelling a pending future discards its waiters; nothing is delivered.
//!
//! The waiter list lives behind a mutex, with an atomic `done` flag as a
//! double-checked fast path for late registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatch::Dispatcher;
use crate::error::Error;

/// The value a future completes with.
///
/// Errors are shared behind `Arc` so every waiter can observe the same fault.
pub type Completion<V> = std::result::Result<V, Arc<Error>>;

type Callback<V> = Box<dyn FnOnce(Completion<V>) + Send + 'static>;

/// Something that can be cancelled.
pub trait Cancelable {
    /// Cancels the operation. Calling this more than once is harmless.
    fn cancel(&self);
}

// =============================================================================
// Shared Cell
// =============================================================================

struct Waiter<V> {
    dispatcher: Arc<dyn Dispatcher>,
    callback: Callback<V>,
}

enum Slot<V> {
    Pending(Vec<Waiter<V>>),
    Complete(Completion<V>),
    Cancelled,
}

struct Cell<V> {
    done: AtomicBool,
    slot: Mutex<Slot<V>>,
    cond: Condvar,
}

impl<V: Clone + Send + 'static> Cell<V> {
    /// Moves the slot out of `Pending`. Returns false if it already left.
    fn complete(&self, completion: Completion<V>) -> bool {
        let waiters = {
            let mut slot = self.slot.lock();
            let waiters = match &mut *slot {
                Slot::Pending(waiters) => std::mem::take(waiters),
                Slot::Complete(_) | Slot::Cancelled => return false,
            };
            *slot = Slot::Complete(completion.clone());
            self.done.store(true, Ordering::Release);
            self.cond.notify_all();
            waiters
        };

        // Run waiters outside the lock so a callback may touch the future.
        for waiter in waiters {
            let value = completion.clone();
            let callback = waiter.callback;
            waiter.dispatcher.dispatch(Box::new(move || callback(value)));
        }
        true
    }

    fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Pending(_) => {
                *slot = Slot::Cancelled;
                self.done.store(true, Ordering::Release);
                self.cond.notify_all();
                true
            }
            Slot::Complete(_) | Slot::Cancelled => false,
        }
    }
}

// =============================================================================
// Promise
// =============================================================================

/// The write side of a [`Future`].
pub struct Promise<V> {
    cell: Arc<Cell<V>>,
}

/// Creates a connected promise/future pair.
pub fn promise<V>() -> (Promise<V>, Future<V>) {
    let cell = Arc::new(Cell {
        done: AtomicBool::new(false),
        slot: Mutex::new(Slot::Pending(Vec::new())),
        cond: Condvar::new(),
    });
    (
        Promise {
            cell: Arc::clone(&cell),
        },
        Future { cell },
    )
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<V: Clone + Send + 'static> Promise<V> {
    /// Completes with a value. Returns false if already completed or cancelled.
    pub fn success(&self, value: V) -> bool {
        self.cell.complete(Ok(value))
    }

    /// Completes with an error. Returns false if already completed or cancelled.
    pub fn failure(&self, error: Arc<Error>) -> bool {
        self.cell.complete(Err(error))
    }

    /// Returns true once the future was cancelled by a consumer.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.cell.slot.lock(), Slot::Cancelled)
    }
}

// =============================================================================
// Future
// =============================================================================

/// The read side of a single-assignment cell.
///
/// Cloning gives another handle to the same cell.
pub struct Future<V> {
    cell: Arc<Cell<V>>,
}

impl<V> Clone for Future<V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<V: Clone + Send + 'static> Future<V> {
    /// Registers a completion callback.
    ///
    /// If the future has already completed, `callback` runs right here on the
    /// calling thread. Otherwise it runs on `dispatcher` once the future
    /// completes. If the future is cancelled, `callback` never runs.
    pub fn on_complete<F>(&self, dispatcher: &Arc<dyn Dispatcher>, callback: F)
    where
        F: FnOnce(Completion<V>) + Send + 'static,
    {
        if self.cell.done.load(Ordering::Acquire) {
            if let Some(completion) = self.try_get() {
                callback(completion);
            }
            return;
        }

        let ready = {
            let mut slot = self.cell.slot.lock();
            match &mut *slot {
                Slot::Pending(waiters) => {
                    waiters.push(Waiter {
                        dispatcher: Arc::clone(dispatcher),
                        callback: Box::new(callback),
                    });
                    return;
                }
                Slot::Complete(completion) => completion.clone(),
                Slot::Cancelled => return,
            }
        };
        callback(ready);
    }

    /// Returns the completion if one has been delivered.
    pub fn try_get(&self) -> Option<Completion<V>> {
        match &*self.cell.slot.lock() {
            Slot::Complete(completion) => Some(completion.clone()),
            Slot::Pending(_) | Slot::Cancelled => None,
        }
    }

    /// Returns true once a value or an error has been delivered.
    pub fn is_complete(&self) -> bool {
        matches!(&*self.cell.slot.lock(), Slot::Complete(_))
    }

    /// Returns true if the future was cancelled before completing.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.cell.slot.lock(), Slot::Cancelled)
    }

    /// Cancels a pending future. Returns false if it had already settled.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Blocks the calling thread until completion, cancellation, or timeout.
    ///
    /// Returns `None` on timeout or cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion<V>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.cell.slot.lock();
        loop {
            match &*slot {
                Slot::Complete(completion) => return Some(completion.clone()),
                Slot::Cancelled => return None,
                Slot::Pending(_) => {
                    if self.cell.cond.wait_until(&mut slot, deadline).timed_out() {
                        return match &*slot {
                            Slot::Complete(completion) => Some(completion.clone()),
                            _ => None,
                        };
                    }
                }
            }
        }
    }

    /// Bridges into `std::future::Future`.
    ///
    /// Resolves to `None` if the future is cancelled.
    pub fn into_async(self) -> impl std::future::Future<Output = Option<Completion<V>>> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.on_complete(&crate::dispatch::inline(), move |completion| {
            let _ = tx.send(completion);
        });
        async move { rx.await.ok() }
    }
}

impl<V: Clone + Send + 'static> Cancelable for Future<V> {
    fn cancel(&self) {
        self.cell.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
