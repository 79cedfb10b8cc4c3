use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use futures::channel::oneshot;

use crate::firestore::constants::{BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER};
use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::user::User;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{
    cancelled, hard_assert, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::local_store::{DocumentMap, LocalStore, LocalViewChanges};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    Timestamp,
};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};

pub type SharedLocalStore = Arc<Mutex<LocalStore>>;

/// Completion of a write, resolved once the backend accepts or rejects it.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receives view snapshots produced by the sync engine.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the query's target. The query has been removed.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has delivered the document at least once.
    received_document: bool,
}

enum RemoteRequest {
    Listen(TargetData),
    Unlisten(i32),
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    /// Views keyed by query canonical id.
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<Query>>,
    /// Limbo keys waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which view targets consider each key to be in limbo.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_user_callbacks: HashMap<User, BTreeMap<i32, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<i32, Vec<WriteCallback>>,
}

/// Bridges the local store, the remote store and the views of active queries.
///
/// Every method is expected to run on the async queue. The local store lock is
/// always taken before the engine's own state lock, and neither is held
/// across an await.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    local_store: SharedLocalStore,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
    listener: OnceLock<Weak<dyn SyncEngineListener>>,
}

impl SyncEngine {
    /// Creates the engine and registers it as the remote store's syncer.
    pub fn new(
        local_store: SharedLocalStore,
        remote_store: RemoteStore,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> FirestoreResult<Self> {
        let inner = Arc::new(SyncEngineInner {
            local_store,
            remote_store: remote_store.clone(),
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                current_user,
                online_state: OnlineState::Unknown,
                query_views: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_user_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
            listener: OnceLock::new(),
        });
        let syncer: Arc<dyn RemoteSyncer> = inner.clone();
        remote_store.set_remote_syncer(Arc::downgrade(&syncer))?;
        Ok(Self { inner })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) -> FirestoreResult<()> {
        self.inner
            .listener
            .set(listener)
            .map_err(|_| internal_error("SyncEngine listener already set"))
    }

    /// Starts tracking `query` and returns its first snapshot, computed from
    /// the local cache.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(query_view) = self.inner.lock_state().query_views.get(&canonical_id) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let allocated = self.inner.lock_local_store().allocate_target(query.to_target());
        let target_data = self.inner.check_persistence(allocated).await?;

        let mut requests = Vec::new();
        let initialized = {
            let mut local_store = self.inner.lock_local_store();
            let mut state = self.inner.lock_state();
            self.inner.initialize_view(
                &mut local_store,
                &mut state,
                query,
                target_data.target_id,
                target_data.resume_token.clone(),
                &mut requests,
            )
        };
        let snapshot = self.inner.check_persistence(initialized).await?;
        self.inner.send_remote_requests(requests).await?;
        if should_listen_to_remote {
            self.inner.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    /// Starts the backend listen for a query that was listened to from cache.
    pub async fn listen_to_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let allocated = self.inner.lock_local_store().allocate_target(query.to_target());
        let target_data = self.inner.check_persistence(allocated).await?;
        self.inner.remote_store.listen(target_data).await
    }

    pub async fn unlisten(&self, query: &Query, should_unlisten_from_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.inner.lock_state();
            let target_id = state
                .query_views
                .get(&canonical_id)
                .map(|query_view| query_view.target_id)
                .ok_or_else(|| internal_error(format!("Trying to unlisten on unknown query {canonical_id}")))?;
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        let released = self.inner.lock_local_store().release_target(target_id, false);
        self.inner.check_persistence(released).await?;
        if should_unlisten_from_remote {
            self.inner.remote_store.unlisten(target_id).await?;
        }
        let mut requests = Vec::new();
        let errors = {
            let mut state = self.inner.lock_state();
            self.inner
                .remove_and_cleanup_target(&mut state, target_id, None, &mut requests)
        };
        debug_assert!(errors.is_empty());
        self.inner.send_remote_requests(requests).await
    }

    /// Stops the backend listen while cache-only listeners remain.
    pub async fn unlisten_from_remote_store(&self, query: &Query) -> FirestoreResult<()> {
        let target_id = {
            let state = self.inner.lock_state();
            let Some(query_view) = state.query_views.get(&query.canonical_id()) else {
                return Ok(());
            };
            let shared = state
                .queries_by_target
                .get(&query_view.target_id)
                .is_some_and(|queries| queries.len() > 1);
            if shared {
                return Ok(());
            }
            query_view.target_id
        };
        self.inner.remote_store.unlisten(target_id).await
    }

    /// Applies `mutations` locally and queues them for the backend. The batch
    /// outcome is sent to `on_complete`.
    pub async fn write(&self, mutations: Vec<Mutation>, on_complete: WriteCallback) -> FirestoreResult<i32> {
        let written = self
            .inner
            .lock_local_store()
            .local_write(mutations, Timestamp::now());
        let result = self.inner.check_persistence(written).await?;
        {
            let mut state = self.inner.lock_state();
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, on_complete);
        }
        self.inner.emit_new_snapshots(&result.changes, None).await?;
        self.inner.remote_store.fill_write_pipeline().await?;
        Ok(result.batch_id)
    }

    /// Resolves `callback` once every write issued so far is acknowledged or
    /// rejected.
    pub fn register_pending_writes_callback(&self, callback: WriteCallback) {
        let highest = self.inner.lock_local_store().get_highest_unacknowledged_batch_id();
        if highest == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        self.inner
            .lock_state()
            .pending_writes_callbacks
            .entry(highest)
            .or_default()
            .push(callback);
    }

    /// Switches to `user`, restarting the streams so they carry the new
    /// credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.remote_store.handle_credential_change(user).await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.lock_state().online_state
    }

    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, i32> {
        self.inner.lock_state().active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.inner
            .lock_state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }
}

impl SyncEngineInner {
    fn lock_state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_local_store(&self) -> MutexGuard<'_, LocalStore> {
        self.local_store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    /// A local persistence failure suspends the network until it recovers.
    async fn check_persistence<T>(&self, result: FirestoreResult<T>) -> FirestoreResult<T> {
        match result {
            Err(err) if err.code == FirestoreErrorCode::Unavailable => {
                log::warn!("local persistence failed; suspending sync: {err}");
                self.remote_store.handle_persistence_failure(&err).await?;
                Err(err)
            }
            other => other,
        }
    }

    fn initialize_view(
        &self,
        local_store: &mut LocalStore,
        state: &mut SyncEngineState,
        query: Query,
        target_id: i32,
        resume_token: Vec<u8>,
        requests: &mut Vec<RemoteRequest>,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None)?;
        let synthesized = TargetChange::synthesized_for_current_change(false, resume_token);
        let view_change = view.apply_changes(changes, true, Some(&synthesized))?;
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes, requests);

        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("First view change must produce a snapshot"))?;
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        Ok(snapshot)
    }

    /// Recomputes every view for the changed documents, raises the resulting
    /// snapshots and pins the displayed documents in the local store.
    async fn emit_new_snapshots(&self, changes: &DocumentMap, remote_event: Option<&RemoteEvent>) -> FirestoreResult<()> {
        let mut requests = Vec::new();
        let snapshots = {
            let mut local_store = self.lock_local_store();
            let mut state = self.lock_state();
            let mut snapshots = Vec::new();
            let mut local_view_changes = Vec::new();
            let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
            for canonical_id in canonical_ids {
                let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                    continue;
                };
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
                if doc_changes.needs_refill {
                    let result = local_store.execute_query(&query_view.query, false)?;
                    doc_changes = query_view
                        .view
                        .compute_doc_changes(&result.documents, Some(doc_changes))?;
                }
                let target_id = query_view.target_id;
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let view_change = query_view.view.apply_changes(doc_changes, true, target_change)?;
                self.update_tracked_limbos(&mut state, target_id, view_change.limbo_changes, &mut requests);
                if let Some(snapshot) = view_change.snapshot {
                    local_view_changes.push(local_view_changes_for(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
            local_store.notify_local_view_changes(&local_view_changes);
            snapshots
        };

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        self.send_remote_requests(requests).await
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
        limbo_changes: Vec<LimboDocumentChange>,
        requests: &mut Vec<RemoteRequest>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    if !state.active_limbo_targets_by_key.contains_key(&key)
                        && !state.enqueued_limbo_resolutions.contains(&key)
                    {
                        log::debug!("new document in limbo: {key}");
                        state.enqueued_limbo_resolutions.push_back(key);
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key, requests);
                    }
                }
            }
        }
        self.pump_enqueued_limbo_resolutions(state, requests);
    }

    fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey, requests: &mut Vec<RemoteRequest>) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = state.active_limbo_targets_by_key.remove(key) {
            state.active_limbo_resolutions_by_target.remove(&target_id);
            requests.push(RemoteRequest::Unlisten(target_id));
            self.pump_enqueued_limbo_resolutions(state, requests);
        }
    }

    /// Starts listens for queued limbo keys while resolution slots are free.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState, requests: &mut Vec<RemoteRequest>) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = state.limbo_target_id_generator.next_id();
            state.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state.active_limbo_targets_by_key.insert(key.clone(), target_id);
            requests.push(RemoteRequest::Listen(TargetData::new(
                Query::for_document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    /// Drops every view of `target_id` and releases its limbo documents.
    /// Returns the queries whose listeners must see `error`.
    fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: i32,
        error: Option<&FirestoreError>,
        requests: &mut Vec<RemoteRequest>,
    ) -> Vec<(Query, FirestoreError)> {
        let mut errors = Vec::new();
        for query in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            state.query_views.remove(&query.canonical_id());
            if let Some(error) = error {
                errors.push((query, error.clone()));
            }
        }
        for key in state.limbo_document_refs.remove_references_for_id(target_id) {
            if !state.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(state, &key, requests);
            }
        }
        errors
    }

    async fn send_remote_requests(&self, requests: Vec<RemoteRequest>) -> FirestoreResult<()> {
        for request in requests {
            match request {
                RemoteRequest::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteRequest::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    fn process_user_callback(&self, batch_id: i32, result: FirestoreResult<()>) {
        let mut state = self.lock_state();
        let user = state.current_user.clone();
        let callback = state
            .mutation_user_callbacks
            .get_mut(&user)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        drop(state);
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: i32) {
        let callbacks = self.lock_state().pending_writes_callbacks.remove(&batch_id);
        for callback in callbacks.unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.lock_state().pending_writes_callbacks);
        for callback in callbacks.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.lock_state();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                hard_assert(change.document_count() <= 1, || {
                    "Limbo resolution for single document contains multiple changes".to_string()
                })?;
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(resolution.received_document, || {
                        "Received change for limbo target document without add".to_string()
                    })?;
                } else if !change.removed_documents.is_empty() {
                    hard_assert(resolution.received_document, || {
                        "Received remove for limbo target document without add".to_string()
                    })?;
                    resolution.received_document = false;
                }
            }
        }
        let changes = self.lock_local_store().apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event)).await
    }

    async fn reject_listen_internal(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = {
            let mut state = self.lock_state();
            let key = state
                .active_limbo_resolutions_by_target
                .remove(&target_id)
                .map(|resolution| resolution.key);
            if let Some(key) = &key {
                state.active_limbo_targets_by_key.remove(key);
            }
            key
        };

        if let Some(key) = limbo_key {
            // The backend cannot resolve the document, so treat it as deleted.
            log::debug!("limbo resolution for {key} rejected: {error}");
            let mut requests = Vec::new();
            self.pump_enqueued_limbo_resolutions(&mut self.lock_state(), &mut requests);
            self.send_remote_requests(requests).await?;

            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event_internal(event).await;
        }

        self.lock_local_store().release_target(target_id, false)?;
        let mut requests = Vec::new();
        let errors = {
            let mut state = self.lock_state();
            self.remove_and_cleanup_target(&mut state, target_id, Some(&error), &mut requests)
        };
        if let Some(listener) = self.listener() {
            for (query, error) in errors {
                listener.on_watch_error(&query, error);
            }
        }
        self.send_remote_requests(requests).await
    }

    async fn apply_successful_write_internal(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.lock_local_store().acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(&changes, None).await
    }

    async fn reject_failed_write_internal(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.lock_local_store().reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots(&changes, None).await
    }

    async fn handle_user_change(&self, user: User) -> FirestoreResult<()> {
        if self.lock_state().current_user == user {
            return Ok(());
        }
        log::debug!("user changed: {user}");
        let changed = self.lock_local_store().handle_user_change(user.clone());
        let result = self.check_persistence(changed).await?;
        self.lock_state().current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "'wait_for_pending_writes' was cancelled by a user change",
        );
        self.emit_new_snapshots(&result.affected_documents, None).await
    }

    fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        let state = self.lock_state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return [resolution.key.clone()].into_iter().collect();
            }
            return BTreeSet::new();
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn online_state_changed(&self, online_state: OnlineState) {
        let snapshots = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                match query_view.view.apply_online_state_change(online_state) {
                    Ok(change) => snapshots.extend(change.snapshot),
                    Err(err) => log::warn!("failed to apply online state to a view: {err}"),
                }
            }
            snapshots
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
        }
    }
}

fn local_view_changes_for(target_id: i32, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.doc.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.doc.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

impl RemoteSyncer for SyncEngineInner {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(&self, target_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(result))
    }

    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_keys_for_target(target_id)
    }

    fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        let batch = self.lock_local_store().next_mutation_batch(after_batch_id);
        box_remote_store_future(async move { Ok(batch) })
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.lock_local_store().get_last_remote_snapshot_version()
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        self.online_state_changed(online_state);
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_user_change(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{failed_precondition, FirestoreErrorCode};
    use crate::firestore::local::{MemoryPersistenceBackend, QueryEngineSettings};
    use crate::firestore::model::{DatabaseId, FieldPath};
    use crate::firestore::remote::connection::EmptyCredentialsProvider;
    use crate::firestore::remote::connectivity_monitor::NoopConnectivityMonitor;
    use crate::firestore::remote::stream::loopback;
    use crate::firestore::test_support::FakeBackend;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::platform::runtime;
    use crate::util::{AsyncQueue, RetrySettings};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreErrorCode)>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    struct Fixture {
        queue: AsyncQueue,
        engine: SyncEngine,
        backend: FakeBackend,
        listener: Arc<RecordingListener>,
    }

    async fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let (connection, server) = loopback();
        let database_id = DatabaseId::new("p", "(default)");
        let backend = FakeBackend::start(server, database_id.clone());
        let local_store = LocalStore::open(
            Arc::new(MemoryPersistenceBackend::new()),
            database_id.clone(),
            User::unauthenticated(),
            QueryEngineSettings::default(),
        )
        .unwrap();
        let remote_store = RemoteStore::new(
            database_id,
            queue.clone(),
            Arc::new(connection),
            Arc::new(EmptyCredentialsProvider),
            RetrySettings::default(),
            Arc::new(NoopConnectivityMonitor),
        );
        let engine = SyncEngine::new(
            Arc::new(Mutex::new(local_store)),
            remote_store.clone(),
            User::unauthenticated(),
            100,
        )
        .unwrap();
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn SyncEngineListener> = Arc::downgrade(&(listener.clone() as Arc<dyn SyncEngineListener>));
        engine.set_listener(weak).unwrap();
        queue.enqueue(async move { remote_store.start().await }).await.unwrap();
        Fixture {
            queue,
            engine,
            backend,
            listener,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(value));
        map
    }

    async fn listen(fixture: &Fixture, query: Query) -> ViewSnapshot {
        let engine = fixture.engine.clone();
        fixture
            .queue
            .enqueue(async move { engine.listen(query, true).await })
            .await
            .unwrap()
    }

    async fn write(fixture: &Fixture, mutation: Mutation) -> oneshot::Receiver<FirestoreResult<()>> {
        let engine = fixture.engine.clone();
        let (sender, receiver) = oneshot::channel();
        fixture
            .queue
            .enqueue(async move { engine.write(vec![mutation], sender).await })
            .await
            .unwrap();
        receiver
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listen_raises_cached_then_synced_snapshot() {
        let fixture = fixture().await;
        fixture.backend.set_document("rooms/a", data(1)).await.unwrap();

        let initial = listen(&fixture, Query::collection("rooms").unwrap()).await;
        assert!(initial.docs.is_empty());
        assert!(initial.from_cache);

        eventually(|| {
            fixture
                .listener
                .snapshots
                .lock()
                .unwrap()
                .iter()
                .any(|snapshot| snapshot.docs.len() == 1 && !snapshot.from_cache)
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_shows_pending_then_resolves_on_ack() {
        let fixture = fixture().await;
        listen(&fixture, Query::collection("rooms").unwrap()).await;

        let key = DocumentKey::from_string("rooms/b").unwrap();
        let receiver = write(&fixture, Mutation::set(key.clone(), data(7))).await;
        assert!(fixture
            .listener
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .any(|snapshot| snapshot.docs.contains(&key) && snapshot.has_pending_writes()));

        receiver.await.unwrap().unwrap();
        assert_eq!(fixture.backend.commit_count().await, 1);
        eventually(|| {
            fixture
                .listener
                .snapshots
                .lock()
                .unwrap()
                .last()
                .is_some_and(|snapshot| snapshot.docs.contains(&key) && !snapshot.has_pending_writes())
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_write_reverts_local_view() {
        let fixture = fixture().await;
        listen(&fixture, Query::collection("rooms").unwrap()).await;
        fixture
            .backend
            .fail_next_write(failed_precondition("rejected"))
            .await;

        let key = DocumentKey::from_string("rooms/c").unwrap();
        let receiver = write(&fixture, Mutation::set(key.clone(), data(1))).await;
        let err = receiver.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        eventually(|| {
            fixture
                .listener
                .snapshots
                .lock()
                .unwrap()
                .last()
                .is_some_and(|snapshot| !snapshot.docs.contains(&key))
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_listen_is_reported_and_removed() {
        let fixture = fixture().await;
        fixture.backend.deny_reads_under("secrets").await.unwrap();
        let query = Query::collection("secrets").unwrap();
        listen(&fixture, query.clone()).await;

        eventually(|| fixture.listener.errors.lock().unwrap().len() == 1).await;
        let (canonical_id, code) = fixture.listener.errors.lock().unwrap()[0].clone();
        assert_eq!(canonical_id, query.canonical_id());
        assert_eq!(code, FirestoreErrorCode::PermissionDenied);

        // The view is gone, so listening again starts over.
        let engine = fixture.engine.clone();
        let result = fixture
            .queue
            .enqueue(async move { engine.unlisten(&query, true).await })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_writes_callback_without_writes_resolves_immediately() {
        let fixture = fixture().await;
        let (sender, receiver) = oneshot::channel();
        fixture.engine.register_pending_writes_callback(sender);
        receiver.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_writes_callback_waits_for_ack() {
        let fixture = fixture().await;
        let key = DocumentKey::from_string("rooms/d").unwrap();
        let write_receiver = write(&fixture, Mutation::set(key, data(2))).await;
        let (sender, receiver) = oneshot::channel();
        fixture.engine.register_pending_writes_callback(sender);
        receiver.await.unwrap().unwrap();
        write_receiver.await.unwrap().unwrap();
        assert_eq!(fixture.backend.commit_count().await, 1);
    }
}
