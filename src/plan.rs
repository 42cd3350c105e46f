//! # Read and Write Plans
//!
//! Plans are produced elsewhere (a model mapper, a query builder). The engine
//! consumes them through two narrow traits:
//!
//! - [`ReadPlan`]: which columns to read and how to turn rows into a value.
//! - [`WritePlan`]: which column values to write.
//!
//! [`FnReadPlan`] and [`ValuesWritePlan`] cover callers without a mapper.

use std::sync::Arc;

use rusqlite::types::Value;

use crate::outcome::Outcome;

// =============================================================================
// Projection
// =============================================================================

/// The set of columns a read selects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    /// `SELECT *`.
    #[default]
    All,
    /// Exactly these columns, in order. An empty list reads nothing.
    Columns(Vec<String>),
}

impl Projection {
    /// Projection over the given columns.
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Columns(columns.into_iter().map(Into::into).collect())
    }

    /// True when there is nothing to select.
    pub fn is_empty(&self) -> bool {
        matches!(self, Projection::Columns(c) if c.is_empty())
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Materialized result of a read: column names plus owned values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Builds a result set.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Column names, in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no row was read.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over the rows.
    pub fn iter(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at `row`, `column`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Reads one column of the first row as a tri-state value.
    ///
    /// No row → `Absent`, SQL NULL → `Null`.
    pub fn first_value(&self, column: &str) -> Outcome<Value> {
        if self.rows.is_empty() {
            return Outcome::Absent;
        }
        match self.get(0, column) {
            None => Outcome::Absent,
            Some(Value::Null) => Outcome::Null,
            Some(v) => Outcome::Value(v.clone()),
        }
    }
}

// =============================================================================
// Column Values
// =============================================================================

/// Kind of write a plan is asked to marshal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// A new row.
    Insert,
    /// An existing row or rows.
    Update,
}

/// Output buffer a [`WritePlan`] writes column values into.
///
/// Owned by a pooled unit and cleared between calls, so the allocation is
/// reused.
#[derive(Debug, Default)]
pub struct ColumnValues {
    names: Vec<String>,
    values: Vec<Value>,
}

impl ColumnValues {
    /// Appends a column value.
    pub fn put(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.names.push(column.into());
        self.values.push(value.into());
    }

    /// Column names written so far.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Values written so far, parallel to [`names`](Self::names).
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns written.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Drops all entries, keeping capacity.
    pub fn clear(&mut self) {
        self.names.clear();
        self.values.clear();
    }
}

// =============================================================================
// Producer
// =============================================================================

/// A lazily computed value.
pub struct Producer<T> {
    produce: Box<dyn FnOnce() -> T + Send>,
}

impl<T> Producer<T> {
    /// Wraps a closure.
    pub fn new(produce: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            produce: Box::new(produce),
        }
    }

    /// Wraps an already computed value.
    pub fn ready(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self::new(move || value)
    }

    /// Materializes the value.
    pub fn get(self) -> T {
        (self.produce)()
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Describes how to read a value of type `V`.
pub trait ReadPlan<V>: Send + Sync {
    /// True if the plan reads nothing. Empty plans never touch storage.
    fn is_empty(&self) -> bool {
        self.projection().is_empty()
    }

    /// Columns to select.
    fn projection(&self) -> Projection;

    /// Turns the rows into a value. Materialization is deferred to the
    /// returned producer.
    fn read(&self, rows: Rows) -> Producer<Outcome<V>>;

    /// Derives the plan for the next read from the latest value.
    ///
    /// `None` keeps the current plan.
    fn refresh(&self, _latest: &Outcome<V>) -> Option<Arc<dyn ReadPlan<V>>> {
        None
    }
}

/// Describes how to write a value.
pub trait WritePlan: Send + Sync {
    /// True if the plan writes nothing. Empty plans never touch storage.
    fn is_empty(&self) -> bool;

    /// Marshals column values for `op` into `output`.
    fn write(&self, op: WriteOp, output: &mut ColumnValues);
}

// =============================================================================
// Adapters
// =============================================================================

/// A read plan from a projection and a conversion closure.
pub struct FnReadPlan<V> {
    projection: Projection,
    convert: Arc<dyn Fn(&Rows) -> Outcome<V> + Send + Sync>,
}

impl<V> FnReadPlan<V> {
    /// Creates the plan.
    pub fn new(
        projection: Projection,
        convert: impl Fn(&Rows) -> Outcome<V> + Send + Sync + 'static,
    ) -> Self {
        Self {
            projection,
            convert: Arc::new(convert),
        }
    }
}

impl<V: Send + 'static> ReadPlan<V> for FnReadPlan<V> {
    fn projection(&self) -> Projection {
        self.projection.clone()
    }

    fn read(&self, rows: Rows) -> Producer<Outcome<V>> {
        let convert = Arc::clone(&self.convert);
        Producer::new(move || convert(&rows))
    }
}

/// A write plan over a fixed list of column values.
#[derive(Debug, Clone, Default)]
pub struct ValuesWritePlan {
    columns: Vec<(String, Value)>,
}

impl ValuesWritePlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column value.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push((column.into(), value.into()));
        self
    }
}

impl WritePlan for ValuesWritePlan {
    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn write(&self, _op: WriteOp, output: &mut ColumnValues) {
        for (column, value) in &self.columns {
            output.put(column.clone(), value.clone());
        }
    }
}
