#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use livequery::{
    ExecutionContext, ExecutorConfig, FnReadPlan, Outcome, Projection, ReadPlan, Rows, Store,
    StoreConfig, WatchListener,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

pub const WAIT: Duration = Duration::from_secs(5);

pub const NOTES_DDL: &str =
    "CREATE TABLE notes (id INTEGER PRIMARY KEY, slug TEXT, title TEXT, body TEXT)";

pub fn create_temp_store(name: &str) -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let store = Store::open(dir.path().join(name), StoreConfig::default()).expect("open store");
    store.execute_batch(NOTES_DDL).expect("create notes table");
    (dir, store)
}

pub fn create_context(store: &Store, workers: usize) -> ExecutionContext {
    ExecutionContext::new(
        store.clone(),
        ExecutorConfig {
            workers,
            ..ExecutorConfig::default()
        },
    )
    .expect("start execution context")
}

pub fn open_read_only(path: PathBuf) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count_rows(store: &Store, table: &str) -> i64 {
    let conn = open_read_only(store.path().to_path_buf());
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .expect("count rows")
}

/// Read plan yielding the number of rows selected.
pub fn row_count_plan() -> Arc<dyn ReadPlan<usize>> {
    Arc::new(FnReadPlan::new(Projection::All, |rows: &Rows| {
        Outcome::Value(rows.len())
    }))
}

/// Listener that records every callback.
pub struct Collect<V> {
    pub results: Mutex<Vec<Outcome<V>>>,
    pub errors: Mutex<Vec<String>>,
}

impl<V> Collect<V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl<V: Clone> Collect<V> {
    pub fn last(&self) -> Option<Outcome<V>> {
        self.results.lock().last().cloned()
    }
}

impl<V: Send + 'static> WatchListener<V> for Collect<V> {
    fn on_result(&self, outcome: Outcome<V>) {
        self.results.lock().push(outcome);
    }

    fn on_error(&self, error: Arc<livequery::Error>) {
        self.errors.lock().push(error.to_string());
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Blocking variant of [`eventually`] for synchronous tests.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !f() {
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
