//! # Change Notification Bus
//!
//! The bus fans committed row changes out to live watchers.
//!
//! ```text
//!   executor connections                         watchers
//!   ┌──────────────┐  update_hook   ┌─────────┐  token   ┌──────────────┐
//!   │ INSERT/UPDATE│──────────────▶ │ pending │ ───────▶ │ route notes/4│
//!   │ DELETE       │  (per conn)    │ changes │ publish  ├──────────────┤
//!   └──────────────┘                └─────────┘  on      │ route notes  │
//!                                                commit  └──────────────┘
//! ```
//!
//! ## Coalescing
//!
//! Every subscriber owns a channel with capacity one. Publishing uses
//! `try_send`: if a token is already waiting, the new change is dropped. A
//! watcher that is busy re-running its plan therefore sees at most one more
//! token, however many changes land meanwhile. The token only means "your
//! data may have changed"; the requery reads the current state anyway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::route::Route;

/// Identifies one bus subscription.
pub type SubscriberId = u64;

/// A committed change to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Table that changed.
    pub table: Arc<str>,
    /// Row that changed, or `None` for a table-wide signal.
    pub rowid: Option<i64>,
}

impl Change {
    /// A change to one row.
    pub fn row(table: impl AsRef<str>, rowid: i64) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            rowid: Some(rowid),
        }
    }

    /// A change to an unspecified set of rows.
    pub fn table(table: impl AsRef<str>) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            rowid: None,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

struct Subscriber {
    id: SubscriberId,
    route: Route,
    tx: mpsc::Sender<Change>,
}

struct BusShared {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<Arc<str>, Vec<Subscriber>>>,
}

/// Publish/subscribe hub for row changes, keyed by table.
///
/// Cloning gives another handle to the same bus.
#[derive(Clone)]
pub struct ChangeBus {
    shared: Arc<BusShared>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribes to changes affecting `route`.
    pub fn subscribe(&self, route: &Route) -> BusSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let table = route.table_arc();

        self.shared
            .subscribers
            .lock()
            .entry(Arc::clone(&table))
            .or_default()
            .push(Subscriber {
                id,
                route: route.clone(),
                tx,
            });

        BusSubscription {
            id,
            table,
            rx,
            bus: Arc::downgrade(&self.shared),
        }
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        remove_subscriber(&self.shared, id)
    }

    /// Publishes committed changes.
    ///
    /// Returns how many tokens were handed out.
    pub fn publish<I>(&self, changes: I) -> usize
    where
        I: IntoIterator<Item = Change>,
    {
        let mut delivered = 0;
        let mut subscribers = self.shared.subscribers.lock();

        for change in changes {
            let Some(list) = subscribers.get_mut(&change.table) else {
                continue;
            };

            list.retain(|sub| {
                if !sub.route.is_affected_by(&change.table, change.rowid) {
                    return true;
                }
                match sub.tx.try_send(change.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        trace!(subscriber = sub.id, table = %change.table, "change coalesced");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });

            if list.is_empty() {
                subscribers.remove(&change.table);
            }
        }

        delivered
    }

    /// Signals that any row of `table` may have changed.
    pub fn notify_table(&self, table: impl AsRef<str>) -> usize {
        self.publish([Change::table(table)])
    }

    /// Signals that one row of `table` changed.
    pub fn notify_row(&self, table: impl AsRef<str>, rowid: i64) -> usize {
        self.publish([Change::row(table, rowid)])
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().values().map(Vec::len).sum()
    }
}

fn remove_subscriber(shared: &BusShared, id: SubscriberId) -> bool {
    let mut subscribers = shared.subscribers.lock();
    let mut removed = false;
    subscribers.retain(|_, list| {
        let before = list.len();
        list.retain(|sub| sub.id != id);
        removed |= list.len() != before;
        !list.is_empty()
    });
    removed
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving end of a bus subscription. Unsubscribes on drop.
pub struct BusSubscription {
    id: SubscriberId,
    table: Arc<str>,
    rx: mpsc::Receiver<Change>,
    bus: Weak<BusShared>,
}

impl BusSubscription {
    /// This subscription's identifier.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Table this subscription listens to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Waits for the next change token.
    ///
    /// Returns `None` once the subscription has been removed from the bus.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Takes a waiting token without blocking.
    pub fn try_recv(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.bus.upgrade() {
            remove_subscriber(&shared, self.id);
        }
    }
}
