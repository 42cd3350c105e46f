//! Execution Context Tests
//!
//! Tests the one-shot execution path:
//! - Empty plans complete with `Absent` without touching storage
//! - Cancellation is quiet, before and during a run
//! - Faults complete the future once and reach the error handler once
//! - Pooled units are reused and the free list stays bounded

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::WAIT;
use livequery::{
    inline, Cancelable, Dispatcher, Error, ErrorHandler, FnReadPlan, Outcome, Projection, ReadPlan,
    Route, Rows, ThreadDispatcher, Value, ValuesWritePlan, WritePlan,
};
use rusqlite::Connection;

fn counting_handler() -> (ErrorHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler: ErrorHandler = Arc::new(move |_: &Error| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

fn title(text: &str) -> Arc<dyn WritePlan> {
    Arc::new(ValuesWritePlan::new().set("title", text.to_string()))
}

/// An insert with an empty write plan completes with `Absent` and never
/// reaches storage (the table does not even exist).
#[test]
fn empty_write_plan_insert_is_absent() {
    let (_dir, store) = common::create_temp_store("empty_plan.db");
    let ctx = common::create_context(&store, 1);
    let (handler, faults) = counting_handler();
    ctx.set_error_handler(Some(handler));

    let result = ctx.insert(Route::table("no_such_table"), Arc::new(ValuesWritePlan::new()));

    assert_eq!(result.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Absent);
    assert_eq!(faults.load(Ordering::SeqCst), 0);
}

/// Same for a read plan with an empty projection.
#[test]
fn empty_read_plan_query_is_absent() {
    let (_dir, store) = common::create_temp_store("empty_read.db");
    let ctx = common::create_context(&store, 1);

    let plan: Arc<dyn ReadPlan<usize>> = Arc::new(FnReadPlan::new(
        Projection::columns(Vec::<String>::new()),
        |_: &Rows| -> Outcome<usize> { panic!("plan must not run") },
    ));
    let result = ctx.query(Route::table("no_such_table"), plan);

    assert_eq!(result.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Absent);
}

/// Cancelling after completion leaves the delivered value alone and raises
/// no error.
#[test]
fn cancel_after_completion_is_noop() {
    let (_dir, store) = common::create_temp_store("cancel_after.db");
    let ctx = common::create_context(&store, 2);
    let (handler, faults) = counting_handler();
    ctx.set_error_handler(Some(handler));

    let result = ctx.insert(Route::table("notes"), title("kept"));
    let value = result.wait_timeout(WAIT).unwrap().unwrap();
    assert_eq!(value, Outcome::Value(1));

    result.cancel();
    result.cancel();

    assert!(!result.is_cancelled());
    assert_eq!(result.try_get().unwrap().unwrap(), Outcome::Value(1));
    assert_eq!(faults.load(Ordering::SeqCst), 0);

    // A callback attached afterwards still sees the value.
    let (tx, rx) = mpsc::channel();
    result.on_complete(&inline(), move |c| tx.send(c.unwrap()).unwrap());
    assert_eq!(rx.try_recv().unwrap(), Outcome::Value(1));
}

/// A running unit is interrupted through the progress handler; the
/// interruption is quiet and the worker keeps serving.
#[test]
fn cancel_interrupts_running_unit_quietly() {
    let (_dir, store) = common::create_temp_store("interrupt.db");
    let ctx = common::create_context(&store, 1);
    let (handler, faults) = counting_handler();
    ctx.set_error_handler(Some(handler));

    let (started_tx, started_rx) = mpsc::channel();
    let endless = ctx.submit(move |conn: &Connection| -> livequery::Result<Outcome<i64>> {
        started_tx.send(()).unwrap();
        let n: i64 = conn.query_row(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT max(x) FROM c",
            [],
            |r| r.get(0),
        )?;
        Ok(Outcome::Value(n))
    });

    started_rx.recv_timeout(WAIT).unwrap();
    endless.cancel();

    // Same single worker: this only completes once the endless unit is gone.
    let next = ctx.submit(|_: &Connection| Ok(Outcome::Value("after")));
    assert_eq!(next.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Value("after"));

    assert!(endless.is_cancelled());
    assert!(endless.try_get().is_none());
    assert_eq!(faults.load(Ordering::SeqCst), 0);
}

/// A fault completes the future with the error and calls the handler once.
#[test]
fn fault_reaches_future_and_handler_once() {
    let (_dir, store) = common::create_temp_store("fault.db");
    let ctx = common::create_context(&store, 2);
    let (handler, faults) = counting_handler();
    ctx.set_error_handler(Some(handler));

    let result = ctx.insert(Route::table("missing"), title("x"));
    let err = result.wait_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(&*err, Error::Sqlite(_)));

    common::wait_until(WAIT, || faults.load(Ordering::SeqCst) == 1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(faults.load(Ordering::SeqCst), 1);
}

/// The handler that is installed when the fault happens is the one called.
#[test]
fn handler_removed_before_fault_is_not_called() {
    let (_dir, store) = common::create_temp_store("handler_swap.db");
    let ctx = common::create_context(&store, 1);
    let (handler, faults) = counting_handler();
    ctx.set_error_handler(Some(handler));
    ctx.clear_error_handler();

    let result = ctx.delete(Route::table("missing"));
    assert!(result.wait_timeout(WAIT).unwrap().is_err());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(faults.load(Ordering::SeqCst), 0);
}

/// A key route that matches several rows fails and changes nothing.
#[test]
fn ambiguous_key_route_is_rejected() {
    let (_dir, store) = common::create_temp_store("ambiguous.db");
    store
        .execute_batch(
            "INSERT INTO notes (slug, title) VALUES ('dup', 'one'), ('dup', 'two'), ('solo', 'three')",
        )
        .unwrap();
    let ctx = common::create_context(&store, 1);

    let dup = Route::key("notes", "slug", Value::Text("dup".into()));
    let err = ctx
        .update(dup, title("changed"))
        .wait_timeout(WAIT)
        .unwrap()
        .unwrap_err();
    assert!(matches!(&*err, Error::AmbiguousRoute { rows: 2, .. }));

    let solo = Route::key("notes", "slug", Value::Text("solo".into()));
    let changed = ctx.update(solo, title("changed")).wait_timeout(WAIT).unwrap().unwrap();
    assert_eq!(changed, Outcome::Value(1));

    let conn = common::open_read_only(store.path().to_path_buf());
    let changed_titles: i64 = conn
        .query_row("SELECT COUNT(*) FROM notes WHERE title = 'changed'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(changed_titles, 1);
}

/// Single-row reads of a missing row are `Absent`; table reads go through
/// the plan even when empty.
#[test]
fn query_distinguishes_missing_row() {
    let (_dir, store) = common::create_temp_store("query.db");
    store
        .execute_batch("INSERT INTO notes (title) VALUES ('a'), (NULL)")
        .unwrap();
    let ctx = common::create_context(&store, 2);

    let title_of: Arc<dyn ReadPlan<Value>> = Arc::new(FnReadPlan::new(Projection::columns(["title"]), |rows: &Rows| {
        rows.first_value("title")
    }));

    let present = ctx.query(Route::row("notes", 1), title_of.clone());
    let null = ctx.query(Route::row("notes", 2), title_of.clone());
    let missing = ctx.query(Route::row("notes", 99), title_of);

    assert_eq!(
        present.wait_timeout(WAIT).unwrap().unwrap(),
        Outcome::Value(Value::Text("a".into()))
    );
    assert_eq!(null.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Null);
    assert_eq!(missing.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Absent);

    store.execute_batch("DELETE FROM notes").unwrap();
    let all = ctx.query(Route::table("notes"), common::row_count_plan());
    assert_eq!(all.wait_timeout(WAIT).unwrap().unwrap(), Outcome::Value(0));
}

/// Units are recycled and the free list never exceeds its bound.
#[test]
fn pooled_units_are_reused() {
    let (_dir, store) = common::create_temp_store("pool.db");
    let ctx = common::create_context(&store, 2);

    let burst: Vec<_> = (0..16)
        .map(|i| ctx.insert(Route::table("notes"), title(&format!("n{}", i))))
        .collect();
    for result in &burst {
        assert!(matches!(
            result.wait_timeout(WAIT).unwrap().unwrap(),
            Outcome::Value(_)
        ));
    }
    assert!(ctx.pool().idle() <= ctx.pool().max_idle());
    assert_eq!(common::count_rows(&store, "notes"), 16);

    let created = ctx.pool().created();
    for _ in 0..10 {
        ctx.exists(Route::row("notes", 1)).wait_timeout(WAIT).unwrap().unwrap();
    }
    assert_eq!(ctx.pool().created(), created);
}

/// Callbacks registered before completion run on their dispatcher.
#[test]
fn callbacks_run_on_their_dispatcher() {
    let (_dir, store) = common::create_temp_store("dispatch.db");
    let ctx = common::create_context(&store, 2);
    let ui = Arc::new(ThreadDispatcher::spawn("ui").unwrap());
    let ui_thread = ui.thread_id();
    let ui: Arc<dyn Dispatcher> = ui;

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let result = ctx.submit(move |_: &Connection| {
        let _ = gate_rx.recv_timeout(WAIT);
        Ok(Outcome::Value(5))
    });

    let (tx, rx) = mpsc::channel();
    result.on_complete(&ui, move |c| {
        tx.send((c.unwrap(), thread::current().id())).unwrap();
    });
    gate_tx.send(()).unwrap();

    let (value, ran_on) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(value, Outcome::Value(5));
    assert_eq!(ran_on, ui_thread);
}

#[tokio::test]
async fn results_can_be_awaited() {
    let (_dir, store) = common::create_temp_store("await.db");
    let ctx = common::create_context(&store, 1);

    let id = ctx
        .insert(Route::table("notes"), title("async"))
        .into_async()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, Outcome::Value(1));

    let found = ctx.exists(Route::row("notes", 1)).into_async().await.unwrap().unwrap();
    assert_eq!(found, Outcome::Value(true));
}
