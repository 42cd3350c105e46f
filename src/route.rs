//! # Resources and Routes
//!
//! A [`Resource`] is the caller's opaque name for a row or row set, such as
//! `"notes/42"`. A [`Route`] is where that name lands physically: a table plus
//! a [`Selection`] of rows. Turning one into the other is the caller's job;
//! the engine only ever sees both side by side.

use std::fmt;
use std::sync::Arc;

use rusqlite::types::Value;

// =============================================================================
// Resource
// =============================================================================

/// Opaque identifier of a row or row set.
///
/// Cheap to clone (shared string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource(Arc<str>);

impl Resource {
    /// Creates a resource identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Resource {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Resource {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Route
// =============================================================================

/// Which rows of a table a route addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Every row of the table.
    All,
    /// The row with this `rowid`.
    RowId(i64),
    /// The row whose `column` equals `value`. Expected to be unique.
    Key {
        /// Column to match.
        column: String,
        /// Value to match.
        value: Value,
    },
}

/// Physical target of a resource: a table and a row selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    table: Arc<str>,
    selection: Selection,
}

impl Route {
    /// Addresses every row of `table`.
    pub fn table(table: impl AsRef<str>) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            selection: Selection::All,
        }
    }

    /// Addresses one row of `table` by `rowid`.
    pub fn row(table: impl AsRef<str>, rowid: i64) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            selection: Selection::RowId(rowid),
        }
    }

    /// Addresses one row of `table` by a key column.
    pub fn key(table: impl AsRef<str>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            table: Arc::from(table.as_ref()),
            selection: Selection::Key {
                column: column.into(),
                value: value.into(),
            },
        }
    }

    /// The table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// The table name as a shared string.
    pub fn table_arc(&self) -> Arc<str> {
        Arc::clone(&self.table)
    }

    /// The row selection.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// True when the route addresses at most one row.
    pub fn is_single_row(&self) -> bool {
        !matches!(self.selection, Selection::All)
    }

    /// True if a change to `rowid` in `table` may affect this route.
    ///
    /// Key selections can't be resolved without a read, so any change in the
    /// table counts. A change with no rowid (an external table-level trigger)
    /// matches every route on the table.
    pub fn is_affected_by(&self, table: &str, rowid: Option<i64>) -> bool {
        if &*self.table != table {
            return false;
        }
        match (&self.selection, rowid) {
            (Selection::RowId(id), Some(changed)) => *id == changed,
            _ => true,
        }
    }
}
