//! Session Lifecycle Tests
//!
//! Tests the session state machine end to end:
//! - Stop is terminal and releases every watcher
//! - Start and submit racing never lose or double-start a watcher
//! - Pause keeps registrations, resume re-runs them
//! - Stopping clears the executor's error handler
//! - Watchers that fail to start or resolve tell their listener and let go
//!   of their worker

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{Collect, WAIT};
use livequery::{
    inline, Cancelable, DispatchPolicy, Error, ErrorHandler, Outcome, Route, Session,
    SessionState, ValuesWritePlan, Watch,
};

fn session(store: &livequery::Store, policy: DispatchPolicy) -> Session {
    Session::new(store.bus().clone(), policy.build(store))
}

fn count_watch(listener: &Arc<Collect<usize>>) -> Watch<usize> {
    Watch::new(common::row_count_plan(), listener.clone(), inline())
}

#[test]
fn stop_releases_everything_and_is_terminal() {
    let (_dir, store) = common::create_temp_store("stop.db");
    store
        .execute_batch("CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT)")
        .unwrap();
    let session = session(&store, DispatchPolicy::PerWatcher);

    let listeners: Vec<Arc<Collect<usize>>> = (0..3).map(|_| Collect::new()).collect();
    let subscriptions: Vec<_> = listeners
        .iter()
        .enumerate()
        .map(|(i, listener)| {
            let table = if i == 2 { "tags" } else { "notes" };
            session
                .submit(Route::table(table), table, count_watch(listener))
                .unwrap()
        })
        .collect();

    session.start().unwrap();
    for listener in &listeners {
        common::wait_until(WAIT, || listener.result_count() == 1);
    }
    assert_eq!(session.running_count(), 3);
    assert_eq!(session.strategy().live_workers(), 3);

    session.stop();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.watcher_count(), 0);
    assert!(subscriptions.iter().all(|s| !s.is_running()));
    assert_eq!(store.bus().subscriber_count(), 0);
    assert_eq!(session.strategy().live_workers(), 0);

    // Nothing is delivered after stop.
    store
        .execute_batch("INSERT INTO notes (title) VALUES ('late'); INSERT INTO tags (name) VALUES ('x')")
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(listeners.iter().all(|l| l.result_count() == 1));

    let late = Collect::new();
    assert!(matches!(
        session.submit(Route::table("notes"), "notes", count_watch(&late)),
        Err(Error::SessionStopped)
    ));
    assert!(matches!(session.start(), Err(Error::SessionStopped)));

    // Stopping again and cancelling stale subscriptions are harmless.
    session.stop();
    for subscription in &subscriptions {
        subscription.cancel();
    }
}

#[test]
fn concurrent_start_and_submit_start_each_watcher_once() {
    let (_dir, store) = common::create_temp_store("race.db");
    let session = Arc::new(session(&store, DispatchPolicy::Single));

    const SUBMITTERS: usize = 8;
    let barrier = Arc::new(Barrier::new(SUBMITTERS + 1));
    let listeners: Vec<Arc<Collect<usize>>> = (0..SUBMITTERS).map(|_| Collect::new()).collect();

    let mut handles = Vec::new();
    for listener in &listeners {
        let session = Arc::clone(&session);
        let barrier = Arc::clone(&barrier);
        let watch = count_watch(listener);
        handles.push(thread::spawn(move || {
            barrier.wait();
            session.submit(Route::table("notes"), "notes", watch).unwrap()
        }));
    }

    barrier.wait();
    session.start().unwrap();
    let subscriptions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(session.watcher_count(), SUBMITTERS);
    assert!(subscriptions.iter().all(|s| s.is_running()));
    for listener in &listeners {
        common::wait_until(WAIT, || listener.result_count() >= 1);
    }
    thread::sleep(Duration::from_millis(100));
    // Exactly one initial run each: a double start would have produced two.
    assert!(listeners.iter().all(|l| l.result_count() == 1));

    session.stop();
}

#[test]
fn pause_keeps_registrations_and_start_resumes() {
    let (_dir, store) = common::create_temp_store("pause.db");
    let session = session(&store, DispatchPolicy::PerTable);
    let listener = Collect::new();
    let subscription = session
        .submit(Route::table("notes"), "notes", count_watch(&listener))
        .unwrap();

    session.start().unwrap();
    common::wait_until(WAIT, || listener.result_count() == 1);

    session.pause().unwrap();
    assert_eq!(session.state(), SessionState::Paused);
    assert_eq!(session.watcher_count(), 1);
    assert!(!subscription.is_running());

    store
        .execute_batch("INSERT INTO notes (title) VALUES ('while paused')")
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(listener.result_count(), 1);

    // Resuming re-runs the read and picks up what happened meanwhile.
    session.start().unwrap();
    assert!(subscription.is_running());
    common::wait_until(WAIT, || listener.result_count() == 2);
    assert_eq!(listener.last(), Some(Outcome::Value(1)));

    session.stop();
}

#[test]
fn cancelled_subscription_is_not_restarted() {
    let (_dir, store) = common::create_temp_store("cancel.db");
    let session = session(&store, DispatchPolicy::PerResource);
    let kept = Collect::new();
    let dropped = Collect::new();

    let _keep = session
        .submit(Route::table("notes"), "kept", count_watch(&kept))
        .unwrap();
    let gone = session
        .submit(Route::table("notes"), "dropped", count_watch(&dropped))
        .unwrap();
    gone.cancel();
    assert_eq!(session.watcher_count(), 1);

    session.start().unwrap();
    common::wait_until(WAIT, || kept.result_count() == 1);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(dropped.result_count(), 0);
    assert_eq!(session.running_count(), 1);
}

#[test]
fn stop_clears_the_error_handler() {
    let dir = tempfile::tempdir().unwrap();
    let live = livequery::LiveStore::open(dir.path().join("live.db"), Default::default()).unwrap();
    live.execute_batch(common::NOTES_DDL).unwrap();

    let faults = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&faults);
    let handler: ErrorHandler = Arc::new(move |_: &Error| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    live.set_error_handler(Some(handler));

    let missing = || Arc::new(ValuesWritePlan::new().set("title", "x".to_string()));
    assert!(live
        .insert(Route::table("missing"), missing())
        .wait_timeout(WAIT)
        .unwrap()
        .is_err());
    common::wait_until(WAIT, || faults.load(Ordering::SeqCst) == 1);

    live.stop();
    assert_eq!(live.state(), SessionState::Stopped);

    // The executor still runs one-shot work, but nobody is told about faults.
    assert!(live
        .insert(Route::table("missing"), missing())
        .wait_timeout(WAIT)
        .unwrap()
        .is_err());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(faults.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_session_stops_watchers() {
    let (_dir, store) = common::create_temp_store("drop.db");
    let listener = Collect::new();
    let subscription = {
        let session = session(&store, DispatchPolicy::PerWatcher);
        let subscription = session
            .submit(Route::table("notes"), "notes", count_watch(&listener))
            .unwrap();
        session.start().unwrap();
        common::wait_until(WAIT, || listener.result_count() == 1);
        subscription
    };

    assert!(!subscription.is_running());
    assert_eq!(store.bus().subscriber_count(), 0);
    // Cancelling after the session is gone only stops the watcher.
    subscription.cancel();
}

#[test]
fn watcher_that_cannot_start_reports_to_its_listener() {
    let (_dir, store) = common::create_temp_store("unopenable.db");
    let session = session(&store, DispatchPolicy::PerWatcher);
    let listener = Collect::new();
    let subscription = session
        .submit(Route::table("notes"), "notes", count_watch(&listener))
        .unwrap();

    // Without the database file the worker's read-only connection can't open.
    let path = store.path().to_path_buf();
    std::fs::remove_file(&path).unwrap();
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(sidecar);
    }

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Started);

    common::wait_until(WAIT, || listener.error_count() == 1);
    assert!(listener.errors.lock()[0].contains("sqlite error"));
    assert_eq!(listener.result_count(), 0);
    assert!(!subscription.is_running());
    assert_eq!(session.running_count(), 0);
    assert_eq!(session.watcher_count(), 1);
}

#[test]
fn unresolved_watcher_releases_its_worker_until_restarted() {
    let (_dir, store) = common::create_temp_store("ghosts.db");
    let session = session(&store, DispatchPolicy::PerWatcher);
    session.start().unwrap();

    let listener = Collect::new();
    let subscription = session
        .submit(Route::table("ghosts"), "ghosts", count_watch(&listener))
        .unwrap();

    common::wait_until(WAIT, || listener.error_count() == 1);
    common::wait_until(WAIT, || !subscription.is_running());
    common::wait_until(WAIT, || session.strategy().live_workers() == 0);
    assert_eq!(session.running_count(), 0);
    assert_eq!(store.bus().subscriber_count(), 0);

    // The registration stays but nothing runs until the session restarts it.
    store
        .execute_batch("CREATE TABLE ghosts (id INTEGER PRIMARY KEY); INSERT INTO ghosts DEFAULT VALUES")
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(listener.result_count(), 0);

    session.pause().unwrap();
    session.start().unwrap();
    common::wait_until(WAIT, || listener.result_count() == 1);
    assert_eq!(listener.last(), Some(Outcome::Value(1)));
    assert!(subscription.is_running());
    assert_eq!(listener.error_count(), 1);

    session.stop();
}
