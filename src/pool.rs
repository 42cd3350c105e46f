//! # Pooled Units
//!
//! Every typed operation on the execution context runs through a
//! [`PooledUnit`]: a reusable task object carrying the route, the plan, and
//! the SQL and value buffers for one call.
//!
//! ```text
//!            acquire()                  init_*()            run()
//!  ┌──────────┐ ───────▶ ┌───────────┐ ───────▶ ┌────────┐ ───────▶ ┌────────┐
//!  │ free list│          │ scrubbed  │          │ stamped│          │ result │
//!  └──────────┘ ◀─────── └───────────┘          └────────┘          └────────┘
//!       ▲        release() (scrub, keep ≤ max_idle)                     │
//!       └────────────────────────── PoolGuard dropped ◀─────────────────┘
//! ```
//!
//! ## Ownership
//!
//! A unit taken from the pool is owned by exactly one [`PoolGuard`]; nothing
//! else can reach it until the guard is dropped, which scrubs every per-call
//! field before the unit goes back on the free list. The pool locks only
//! around free-list manipulation.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;
use crate::outcome::Outcome;
use crate::plan::{ColumnValues, Projection, Rows, WriteOp, WritePlan};
use crate::route::Route;
use crate::statement::{self, StatementBuffer};

// =============================================================================
// Unit Kinds
// =============================================================================

/// The operation a pooled unit performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Checks whether the route selects any row.
    Exists,
    /// Inserts one row built from a write plan.
    Insert,
    /// Updates the routed rows from a write plan.
    Update,
    /// Deletes the routed rows.
    Delete,
    /// Reads the routed rows through a projection.
    Query,
}

/// Raw result of running a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutput {
    /// Result of [`UnitKind::Exists`].
    Exists(bool),
    /// Rowid of the row created by [`UnitKind::Insert`].
    Inserted(i64),
    /// Rows touched by [`UnitKind::Update`] or [`UnitKind::Delete`].
    Changed(usize),
    /// Rows read by [`UnitKind::Query`].
    Rows(Rows),
}

/// Token stamped on a unit each time it leaves the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Receipt(u64);

impl Receipt {
    /// The raw token.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

// =============================================================================
// Pooled Unit
// =============================================================================

/// A reusable task object. See the module docs.
#[derive(Default)]
pub struct PooledUnit {
    serial: u64,
    receipt: Option<Receipt>,
    kind: Option<UnitKind>,
    route: Option<Route>,
    write_plan: Option<Arc<dyn WritePlan>>,
    projection: Projection,
    values: ColumnValues,
    buffer: StatementBuffer,
}

impl PooledUnit {
    fn new(serial: u64) -> Self {
        Self {
            serial,
            ..Self::default()
        }
    }

    /// Identifies the instance across its whole life in the pool.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Receipt of the current borrow, if the unit is out of the pool.
    pub fn receipt(&self) -> Option<Receipt> {
        self.receipt
    }

    /// The operation this unit has been stamped with.
    pub fn kind(&self) -> Option<UnitKind> {
        self.kind
    }

    fn stamp(&mut self, kind: UnitKind, route: Route) -> &mut Self {
        self.kind = Some(kind);
        self.route = Some(route);
        self
    }

    /// Prepares an existence check.
    pub fn init_exists(&mut self, route: Route) -> &mut Self {
        self.stamp(UnitKind::Exists, route)
    }

    /// Prepares an insert.
    pub fn init_insert(&mut self, route: Route, plan: Arc<dyn WritePlan>) -> &mut Self {
        self.write_plan = Some(plan);
        self.stamp(UnitKind::Insert, route)
    }

    /// Prepares an update.
    pub fn init_update(&mut self, route: Route, plan: Arc<dyn WritePlan>) -> &mut Self {
        self.write_plan = Some(plan);
        self.stamp(UnitKind::Update, route)
    }

    /// Prepares a delete.
    pub fn init_delete(&mut self, route: Route) -> &mut Self {
        self.stamp(UnitKind::Delete, route)
    }

    /// Prepares a read of `projection`.
    pub fn init_query(&mut self, route: Route, projection: Projection) -> &mut Self {
        self.projection = projection;
        self.stamp(UnitKind::Query, route)
    }

    /// Runs the stamped operation.
    ///
    /// An unstamped unit, an empty write plan, or an empty projection yields
    /// `Absent` without touching storage.
    pub fn run(&mut self, conn: &Connection) -> Result<Outcome<UnitOutput>> {
        let (Some(kind), Some(route)) = (self.kind, self.route.as_ref()) else {
            return Ok(Outcome::Absent);
        };

        let output = match kind {
            UnitKind::Exists => UnitOutput::Exists(statement::exists(conn, route, &mut self.buffer)?),
            UnitKind::Insert | UnitKind::Update => {
                let Some(plan) = self.write_plan.as_ref() else {
                    return Ok(Outcome::Absent);
                };
                if plan.is_empty() {
                    return Ok(Outcome::Absent);
                }

                self.values.clear();
                if kind == UnitKind::Insert {
                    plan.write(WriteOp::Insert, &mut self.values);
                    UnitOutput::Inserted(statement::insert(conn, route, &self.values, &mut self.buffer)?)
                } else {
                    plan.write(WriteOp::Update, &mut self.values);
                    UnitOutput::Changed(statement::update(conn, route, &self.values, &mut self.buffer)?)
                }
            }
            UnitKind::Delete => UnitOutput::Changed(statement::delete(conn, route, &mut self.buffer)?),
            UnitKind::Query => {
                if self.projection.is_empty() {
                    return Ok(Outcome::Absent);
                }
                UnitOutput::Rows(statement::select(conn, route, &self.projection, &mut self.buffer)?)
            }
        };

        Ok(Outcome::Value(output))
    }

    /// Clears every per-call field. Buffers keep their capacity.
    pub fn scrub(&mut self) {
        self.receipt = None;
        self.kind = None;
        self.route = None;
        self.write_plan = None;
        self.projection = Projection::All;
        self.values.clear();
        self.buffer.clear();
    }

    /// True when no per-call state remains.
    pub fn is_scrubbed(&self) -> bool {
        self.receipt.is_none()
            && self.kind.is_none()
            && self.route.is_none()
            && self.write_plan.is_none()
            && self.projection == Projection::All
            && self.values.is_empty()
            && self.buffer.is_empty()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Free list of [`PooledUnit`]s owned by one execution context.
pub struct UnitPool {
    free: Mutex<Vec<PooledUnit>>,
    max_idle: usize,
    created: AtomicU64,
    next_receipt: AtomicU64,
}

impl UnitPool {
    /// Creates an empty pool that keeps at most `max_idle` free units.
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            created: AtomicU64::new(0),
            next_receipt: AtomicU64::new(1),
        })
    }

    /// Takes a free unit, or builds one, and stamps a fresh receipt.
    pub fn acquire(self: &Arc<Self>) -> PoolGuard {
        let reused = self.free.lock().pop();
        let mut unit = match reused {
            Some(unit) => unit,
            None => PooledUnit::new(self.created.fetch_add(1, Ordering::Relaxed) + 1),
        };
        debug_assert!(unit.is_scrubbed());
        unit.receipt = Some(Receipt(self.next_receipt.fetch_add(1, Ordering::Relaxed)));

        PoolGuard {
            unit: Some(unit),
            pool: Arc::clone(self),
        }
    }

    /// Scrubs `unit` and returns it to the free list if there is room.
    pub fn release(&self, mut unit: PooledUnit) {
        unit.scrub();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(unit);
        }
    }

    /// Number of units on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of units ever constructed.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Upper bound on the free list.
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }
}

/// Exclusive handle on a borrowed unit. Releases it on drop.
pub struct PoolGuard {
    unit: Option<PooledUnit>,
    pool: Arc<UnitPool>,
}

impl Deref for PoolGuard {
    type Target = PooledUnit;

    fn deref(&self) -> &PooledUnit {
        // Only `Drop` takes the unit out.
        self.unit.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut PooledUnit {
        self.unit.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.pool.release(unit);
        }
    }
}
