use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::core::query::Query;
use crate::firestore::core::settings::{ListenOptions, ListenSource};
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::online_state_tracker::OnlineState;

/// Receives the snapshots (or the terminal error) of one query listener.
pub type QueryObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Default)]
struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Filters the view snapshots of a query down to the events one caller asked
/// for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: QueryObserver,
    state: Mutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: QueryObserver) -> Self {
        Self {
            query,
            options,
            observer,
            state: Mutex::new(QueryListenerState::default()),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    fn lock_state(&self) -> MutexGuard<'_, QueryListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&self, mut snapshot: ViewSnapshot) -> bool {
        if !self.options.include_metadata_changes {
            snapshot
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let event = {
            let mut state = self.lock_state();
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };

        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Empty cached results are held back until the backend answers or we
        // know we are offline.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    )
}

struct QueryListenersInfo {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(|listener| listener.listens_to_remote_store())
    }
}

#[derive(Default)]
struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans the sync engine's snapshots out to the listeners of each query.
///
/// Listeners of equal queries share one view. Observers are always invoked
/// with no internal lock held.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<EventManagerInner>,
}

struct EventManagerInner {
    sync_engine: SyncEngine,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    /// Creates the manager and subscribes it to `sync_engine`.
    pub fn new(sync_engine: SyncEngine) -> FirestoreResult<Self> {
        let inner = Arc::new(EventManagerInner {
            sync_engine: sync_engine.clone(),
            state: Mutex::new(EventManagerState::default()),
        });
        let listener: Arc<dyn SyncEngineListener> = inner.clone();
        sync_engine.set_listener(Arc::downgrade(&listener))?;
        Ok(Self { inner })
    }

    /// Registers `listener`, starting a sync engine listen for the first
    /// listener of its query. Failures are delivered to the listener.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();
        let listens_to_remote = listener.listens_to_remote_store();

        let (first_listen, first_remote_listen) = {
            let state = self.inner.lock_state();
            match state.queries.get(&canonical_id) {
                None => (true, listens_to_remote),
                Some(info) => (false, listens_to_remote && !info.has_remote_listeners()),
            }
        };

        let started = if first_listen {
            self.inner
                .sync_engine
                .listen(query.clone(), listens_to_remote)
                .await
                .map(Some)
        } else if first_remote_listen {
            self.inner
                .sync_engine
                .listen_to_remote_store(&query)
                .await
                .map(|()| None)
        } else {
            Ok(None)
        };
        let initial_snapshot = match started {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!("listen for {canonical_id} failed: {err}");
                listener.on_error(err.clone());
                return Err(err);
            }
        };

        let (view_snapshot, online_state) = {
            let mut state = self.inner.lock_state();
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    query,
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if initial_snapshot.is_some() {
                info.view_snapshot = initial_snapshot;
            }
            info.listeners.push(listener.clone());
            (info.view_snapshot.clone(), online_state)
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            listener.on_view_snapshot(snapshot);
        }
        Ok(())
    }

    /// Removes `listener`. The last listener of a query stops its listen.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();

        let (last_listen, last_remote_listen) = {
            let mut state = self.inner.lock_state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let Some(index) = info.listeners.iter().position(|other| Arc::ptr_eq(other, listener)) else {
                return Ok(());
            };
            info.listeners.remove(index);
            let last_listen = info.listeners.is_empty();
            let last_remote_listen = listener.listens_to_remote_store() && !info.has_remote_listeners();
            if last_listen {
                state.queries.remove(&canonical_id);
            }
            (last_listen, last_remote_listen)
        };

        if last_listen {
            self.inner.sync_engine.unlisten(&query, last_remote_listen).await
        } else if last_remote_listen {
            self.inner.sync_engine.unlisten_from_remote_store(&query).await
        } else {
            Ok(())
        }
    }

    pub fn query_count(&self) -> usize {
        self.inner.lock_state().queries.len()
    }
}

impl EventManagerInner {
    fn lock_state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SyncEngineListener for EventManagerInner {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries: Vec<(Vec<Arc<QueryListener>>, ViewSnapshot)> = {
            let mut state = self.lock_state();
            snapshots
                .into_iter()
                .filter_map(|snapshot| {
                    let info = state.queries.get_mut(&snapshot.query.canonical_id())?;
                    info.view_snapshot = Some(snapshot.clone());
                    Some((info.listeners.clone(), snapshot))
                })
                .collect()
        };
        for (listeners, snapshot) in deliveries {
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let info = self.lock_state().queries.remove(&query.canonical_id());
        if let Some(info) = info {
            log::debug!("listen for {} failed: {error}", info.query.canonical_id());
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}
