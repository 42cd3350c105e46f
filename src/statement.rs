//! SQL statement builders for route-addressed reads and writes.
//!
//! Every function writes its SQL into a caller-owned [`StatementBuffer`] so
//! pooled units and watcher loops reuse the same allocations call after call.
//! Statements go through `prepare_cached`, so a watcher re-running the same
//! plan reuses the compiled statement as well.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::plan::{ColumnValues, Projection, Rows};
use crate::route::{Route, Selection};

/// Reusable SQL text and parameter storage.
#[derive(Debug, Default)]
pub struct StatementBuffer {
    sql: String,
    params: Vec<Value>,
}

impl StatementBuffer {
    /// Empties the buffer, keeping capacity.
    pub fn clear(&mut self) {
        self.sql.clear();
        self.params.clear();
    }

    /// True when the buffer holds no SQL and no parameters.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty() && self.params.is_empty()
    }

    /// The SQL most recently built.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Appends `name` as a quoted SQL identifier.
fn push_ident(out: &mut String, name: &str) {
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
}

fn push_where(buf: &mut StatementBuffer, route: &Route, for_delete: bool) {
    match route.selection() {
        Selection::All => {
            // Keeps SQLite off the truncate path, which skips the update hook.
            if for_delete {
                buf.sql.push_str(" WHERE 1");
            }
        }
        Selection::RowId(id) => {
            buf.sql.push_str(" WHERE rowid = ?");
            buf.params.push(Value::Integer(*id));
        }
        Selection::Key { column, value } => {
            buf.sql.push_str(" WHERE ");
            push_ident(&mut buf.sql, column);
            buf.sql.push_str(" = ?");
            buf.params.push(value.clone());
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Returns true if `table` exists in the main schema.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found = conn
        .prepare_cached("SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1")?
        .query_row([table], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Fails with [`Error::UnknownResource`] if `table` does not exist.
pub fn require_table(conn: &Connection, table: &str) -> Result<()> {
    if table_exists(conn, table)? {
        Ok(())
    } else {
        Err(Error::UnknownResource {
            table: table.to_string(),
        })
    }
}

// =============================================================================
// Reads
// =============================================================================

/// Reads the projected columns of every row the route selects.
pub fn select(
    conn: &Connection,
    route: &Route,
    projection: &Projection,
    buf: &mut StatementBuffer,
) -> Result<Rows> {
    buf.clear();
    buf.sql.push_str("SELECT ");
    match projection {
        Projection::All => buf.sql.push('*'),
        Projection::Columns(columns) => {
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    buf.sql.push_str(", ");
                }
                push_ident(&mut buf.sql, column);
            }
        }
    }
    buf.sql.push_str(" FROM ");
    push_ident(&mut buf.sql, route.table_name());
    push_where(buf, route, false);

    let mut stmt = conn.prepare_cached(&buf.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(buf.params.iter()))?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        rows.push(values);
    }

    Ok(Rows::new(columns, rows))
}

/// Returns true if the route selects at least one row.
pub fn exists(conn: &Connection, route: &Route, buf: &mut StatementBuffer) -> Result<bool> {
    buf.clear();
    buf.sql.push_str("SELECT EXISTS (SELECT 1 FROM ");
    push_ident(&mut buf.sql, route.table_name());
    push_where(buf, route, false);
    buf.sql.push(')');

    let found: bool = conn
        .prepare_cached(&buf.sql)?
        .query_row(params_from_iter(buf.params.iter()), |row| row.get(0))?;
    Ok(found)
}

// =============================================================================
// Writes
// =============================================================================

/// Inserts one row into the route's table. Returns the new rowid.
pub fn insert(
    conn: &Connection,
    route: &Route,
    values: &ColumnValues,
    buf: &mut StatementBuffer,
) -> Result<i64> {
    buf.clear();
    buf.sql.push_str("INSERT INTO ");
    push_ident(&mut buf.sql, route.table_name());

    if values.is_empty() {
        buf.sql.push_str(" DEFAULT VALUES");
    } else {
        buf.sql.push_str(" (");
        for (i, name) in values.names().iter().enumerate() {
            if i > 0 {
                buf.sql.push_str(", ");
            }
            push_ident(&mut buf.sql, name);
        }
        buf.sql.push_str(") VALUES (");
        for i in 0..values.len() {
            if i > 0 {
                buf.sql.push_str(", ");
            }
            buf.sql.push('?');
        }
        buf.sql.push(')');
        buf.params.extend(values.values().iter().cloned());
    }

    conn.prepare_cached(&buf.sql)?
        .execute(params_from_iter(buf.params.iter()))?;
    Ok(conn.last_insert_rowid())
}

/// Updates the rows the route selects. Returns the number of rows changed.
pub fn update(
    conn: &Connection,
    route: &Route,
    values: &ColumnValues,
    buf: &mut StatementBuffer,
) -> Result<usize> {
    if values.is_empty() {
        return Ok(0);
    }

    buf.clear();
    buf.sql.push_str("UPDATE ");
    push_ident(&mut buf.sql, route.table_name());
    buf.sql.push_str(" SET ");
    for (i, name) in values.names().iter().enumerate() {
        if i > 0 {
            buf.sql.push_str(", ");
        }
        push_ident(&mut buf.sql, name);
        buf.sql.push_str(" = ?");
    }
    buf.params.extend(values.values().iter().cloned());
    push_where(buf, route, false);

    guarded_write(conn, route, buf)
}

/// Deletes the rows the route selects. Returns the number of rows deleted.
pub fn delete(conn: &Connection, route: &Route, buf: &mut StatementBuffer) -> Result<usize> {
    buf.clear();
    buf.sql.push_str("DELETE FROM ");
    push_ident(&mut buf.sql, route.table_name());
    push_where(buf, route, true);

    guarded_write(conn, route, buf)
}

/// Runs a write, refusing to let a key route touch more than one row.
///
/// Key routes run inside a savepoint; if more than one row changed the
/// savepoint is rolled back and the write fails. Rowid and whole-table routes
/// can't be ambiguous and run directly.
fn guarded_write(conn: &Connection, route: &Route, buf: &StatementBuffer) -> Result<usize> {
    if !matches!(route.selection(), Selection::Key { .. }) {
        let changed = conn
            .prepare_cached(&buf.sql)?
            .execute(params_from_iter(buf.params.iter()))?;
        return Ok(changed);
    }

    conn.execute_batch("SAVEPOINT livequery_single_row")?;

    let result = conn
        .prepare_cached(&buf.sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(buf.params.iter())));

    match result {
        Ok(changed) if changed <= 1 => {
            conn.execute_batch("RELEASE livequery_single_row")?;
            Ok(changed)
        }
        Ok(changed) => {
            conn.execute_batch(
                "ROLLBACK TO livequery_single_row; RELEASE livequery_single_row",
            )?;
            Err(Error::AmbiguousRoute {
                table: route.table_name().to_string(),
                rows: changed,
            })
        }
        Err(e) => {
            // An interrupted statement may already have ended the transaction.
            if !conn.is_autocommit() {
                let _ = conn.execute_batch(
                    "ROLLBACK TO livequery_single_row; RELEASE livequery_single_row",
                );
            }
            Err(e.into())
        }
    }
}
