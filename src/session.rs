//! # Sessions
//!
//! A [`Session`] owns the live subscriptions of one data-access object and
//! drives them through a small state machine:
//!
//! ```text
//!                 start              pause
//!  Initialized ─────────▶ Started ─────────▶ Paused
//!       │                  ▲  │                │
//!       │                  │  └──── start ◀────┘
//!       │ stop             │ stop              │ stop
//!       ▼                  ▼                   ▼
//!  ┌───────────────────────────────────────────────┐
//!  │ Stopped (terminal: registry cleared, error    │
//!  │ handler removed, start/pause/submit rejected) │
//!  └───────────────────────────────────────────────┘
//! ```
//!
//! Every transition and every registry change happens under one mutex. A
//! watcher submitted while the session is `Started` is started inside that
//! same critical section, so a concurrent `start` can neither miss it nor
//! start it twice.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::ChangeBus;
use crate::error::{Error, Result};
use crate::executor::ExecutionContext;
use crate::future::Cancelable;
use crate::route::{Resource, Route};
use crate::strategy::{DispatchKey, DispatchStrategy};
use crate::watcher::{ChangeWatcher, Watch};
use crate::worker::Worker;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; watchers may be registered but none run.
    Initialized,
    /// Watchers run.
    Started,
    /// Watchers are registered but stopped.
    Paused,
    /// Terminal.
    Stopped,
}

/// Type-erased view of a watcher for the registry.
trait ManagedWatcher: Send + Sync {
    fn id(&self) -> u64;
    fn dispatch_key(&self) -> DispatchKey;
    fn start(&self, lease: Arc<Worker>) -> Result<()>;
    fn stop(&self) -> bool;
    fn is_running(&self) -> bool;
    fn fail(&self, error: Error);
}

impl<V: Send + 'static> ManagedWatcher for ChangeWatcher<V> {
    fn id(&self) -> u64 {
        ChangeWatcher::id(self)
    }

    fn dispatch_key(&self) -> DispatchKey {
        ChangeWatcher::dispatch_key(self)
    }

    fn start(&self, lease: Arc<Worker>) -> Result<()> {
        ChangeWatcher::start(self, lease)
    }

    fn stop(&self) -> bool {
        ChangeWatcher::stop(self)
    }

    fn is_running(&self) -> bool {
        ChangeWatcher::is_running(self)
    }

    fn fail(&self, error: Error) {
        ChangeWatcher::fail(self, error)
    }
}

struct Registry {
    state: SessionState,
    watchers: Vec<Arc<dyn ManagedWatcher>>,
    next_id: u64,
}

struct SessionShared {
    registry: Mutex<Registry>,
    strategy: Arc<dyn DispatchStrategy>,
    bus: ChangeBus,
    context: Option<Arc<ExecutionContext>>,
}

impl SessionShared {
    fn start_watcher(&self, watcher: &dyn ManagedWatcher) -> Result<()> {
        let lease = self.strategy.acquire(&watcher.dispatch_key())?;
        watcher.start(lease)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Subscription lifecycle of one data-access object. Stops on drop.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// A session whose watchers listen on `bus` and run where `strategy`
    /// puts them.
    pub fn new(bus: ChangeBus, strategy: Arc<dyn DispatchStrategy>) -> Self {
        Self::build(bus, strategy, None)
    }

    /// A session tied to an execution context. Stopping the session also
    /// removes the context's error handler.
    pub fn with_context(context: Arc<ExecutionContext>, strategy: Arc<dyn DispatchStrategy>) -> Self {
        let bus = context.store().bus().clone();
        Self::build(bus, strategy, Some(context))
    }

    fn build(
        bus: ChangeBus,
        strategy: Arc<dyn DispatchStrategy>,
        context: Option<Arc<ExecutionContext>>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                registry: Mutex::new(Registry {
                    state: SessionState::Initialized,
                    watchers: Vec::new(),
                    next_id: 0,
                }),
                strategy,
                bus,
                context,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.registry.lock().state
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.shared.registry.lock().watchers.len()
    }

    /// Number of registered watchers whose loop is running.
    pub fn running_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .watchers
            .iter()
            .filter(|w| w.is_running())
            .count()
    }

    /// The dispatch strategy.
    pub fn strategy(&self) -> &Arc<dyn DispatchStrategy> {
        &self.shared.strategy
    }

    /// Starts every registered watcher, in registration order.
    ///
    /// A watcher that cannot be started stays registered and its listener
    /// gets the error through `on_error`; the rest still start. A no-op
    /// while already started.
    pub fn start(&self) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        match registry.state {
            SessionState::Stopped => return Err(Error::SessionStopped),
            SessionState::Started => return Ok(()),
            SessionState::Initialized | SessionState::Paused => {}
        }

        let mut failed = Vec::new();
        for watcher in &registry.watchers {
            if let Err(e) = self.shared.start_watcher(watcher.as_ref()) {
                warn!(watcher = watcher.id(), error = %e, "failed to start watcher");
                failed.push((Arc::clone(watcher), e));
            }
        }
        registry.state = SessionState::Started;
        debug!(watchers = registry.watchers.len(), failed = failed.len(), "session started");
        drop(registry);

        // Inline listeners may call back into the session.
        for (watcher, error) in failed {
            watcher.fail(error);
        }
        Ok(())
    }

    /// Stops every watcher but keeps the registrations.
    ///
    /// A no-op unless started.
    pub fn pause(&self) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        match registry.state {
            SessionState::Stopped => return Err(Error::SessionStopped),
            SessionState::Started => {}
            SessionState::Initialized | SessionState::Paused => return Ok(()),
        }

        for watcher in &registry.watchers {
            watcher.stop();
        }
        registry.state = SessionState::Paused;
        debug!("session paused");
        Ok(())
    }

    /// Stops every watcher, clears the registry, and removes the error
    /// handler. Terminal; calling it again does nothing.
    pub fn stop(&self) {
        let mut registry = self.shared.registry.lock();
        if registry.state == SessionState::Stopped {
            return;
        }

        for watcher in registry.watchers.drain(..) {
            watcher.stop();
        }
        registry.state = SessionState::Stopped;

        if let Some(context) = &self.shared.context {
            context.clear_error_handler();
        }
        debug!("session stopped");
    }

    /// Registers a watcher for `route` and starts it if the session is
    /// started.
    ///
    /// If that start fails the watcher is not registered and the error is
    /// returned here instead of going to the listener.
    pub fn submit<V: Send + 'static>(
        &self,
        route: Route,
        resource: impl Into<Resource>,
        watch: Watch<V>,
    ) -> Result<Subscription> {
        let mut registry = self.shared.registry.lock();
        if registry.state == SessionState::Stopped {
            return Err(Error::SessionStopped);
        }

        registry.next_id += 1;
        let id = registry.next_id;
        let watcher: Arc<dyn ManagedWatcher> = Arc::new(ChangeWatcher::new(
            id,
            route,
            resource.into(),
            watch,
            self.shared.bus.clone(),
        ));

        if registry.state == SessionState::Started {
            self.shared.start_watcher(watcher.as_ref())?;
        }
        registry.watchers.push(Arc::clone(&watcher));

        Ok(Subscription {
            id,
            session: Arc::downgrade(&self.shared),
            watcher,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle on one registered watcher. Cancelling unregisters and stops it.
pub struct Subscription {
    id: u64,
    session: Weak<SessionShared>,
    watcher: Arc<dyn ManagedWatcher>,
}

impl Subscription {
    /// Watcher id within the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True while the watcher's loop runs.
    pub fn is_running(&self) -> bool {
        self.watcher.is_running()
    }
}

impl Cancelable for Subscription {
    fn cancel(&self) {
        match self.session.upgrade() {
            Some(shared) => {
                let mut registry = shared.registry.lock();
                registry.watchers.retain(|w| w.id() != self.id);
                self.watcher.stop();
            }
            None => {
                self.watcher.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::inline;
    use crate::outcome::Outcome;
    use crate::plan::{FnReadPlan, Projection, Rows};
    use crate::store::{Store, StoreConfig};
    use crate::strategy::Single;
    use crate::watcher::WatchListener;

    struct Ignore;

    impl WatchListener<usize> for Ignore {
        fn on_result(&self, _outcome: Outcome<usize>) {}
    }

    fn watch() -> Watch<usize> {
        Watch::new(
            Arc::new(FnReadPlan::new(Projection::All, |rows: &Rows| {
                Outcome::Value(rows.len())
            })),
            Arc::new(Ignore),
            inline(),
        )
    }

    fn session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("s.db"), StoreConfig::default()).unwrap();
        store.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY)").unwrap();
        let strategy = Arc::new(Single::new(store.clone()));
        (dir, Session::new(store.bus().clone(), strategy))
    }

    #[test]
    fn test_transitions() {
        let (_dir, session) = session();
        assert_eq!(session.state(), SessionState::Initialized);

        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Initialized);

        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Started);

        session.pause().unwrap();
        assert_eq!(session.state(), SessionState::Paused);

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start(), Err(Error::SessionStopped)));
        assert!(matches!(session.pause(), Err(Error::SessionStopped)));
    }

    #[test]
    fn test_submit_follows_state() {
        let (_dir, session) = session();
        let idle = session.submit(Route::table("notes"), "notes", watch()).unwrap();
        assert!(!idle.is_running());

        session.start().unwrap();
        assert!(idle.is_running());
        let live = session.submit(Route::table("notes"), "notes", watch()).unwrap();
        assert!(live.is_running());
        assert_eq!(session.running_count(), 2);

        session.pause().unwrap();
        assert_eq!(session.running_count(), 0);
        assert_eq!(session.watcher_count(), 2);
    }

    #[test]
    fn test_cancel_subscription() {
        let (_dir, session) = session();
        session.start().unwrap();
        let sub = session.submit(Route::table("notes"), "notes", watch()).unwrap();

        sub.cancel();
        sub.cancel();
        assert_eq!(session.watcher_count(), 0);
        assert!(!sub.is_running());

        session.start().unwrap();
        assert!(!sub.is_running());
    }
}
