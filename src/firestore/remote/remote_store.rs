use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::constants::MAX_PENDING_WRITES;
use crate::firestore::core::user::User;
use crate::firestore::error::{
    failed_precondition, hard_assert, is_permanent_error, is_permanent_write_error, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
};
use crate::firestore::remote::connection::{ConnectionArc, CredentialsProviderArc};
use crate::firestore::remote::connectivity_monitor::{ConnectivityMonitor, NetworkStatus};
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    ListenStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::util::{AsyncQueue, RetrySettings};

/// Why the remote store is not using the network. Any cause keeps it offline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    PersistenceFailure,
    CredentialChange,
    ConnectivityChange,
    Shutdown,
}

#[derive(Default)]
struct RemoteStoreState {
    /// Targets the sync engine listens to, keyed by target id.
    listen_targets: BTreeMap<i32, TargetData>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    /// Batches handed to the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }
}

struct ListenTargetsMetadata<'a> {
    listen_targets: &'a BTreeMap<i32, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetsMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the listen and write streams and keeps them in step with the sync
/// engine's targets and pending writes.
///
/// All methods are expected to run on the async queue. The internal lock is
/// never held while calling the [`RemoteSyncer`] or stopping a stream, so the
/// syncer may call straight back into the store.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        retry: RetrySettings,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let serializer = JsonProtoSerializer::new(database_id.clone());
            let watch_listener: Weak<dyn WatchStreamListener> = weak.clone();
            let write_listener: Weak<dyn WriteStreamListener> = weak.clone();
            let online_weak = weak.clone();
            let online_state = OnlineStateTracker::new(
                queue.clone(),
                Arc::new(move |state| {
                    if let Some(inner) = online_weak.upgrade() {
                        if let Ok(syncer) = inner.syncer() {
                            syncer.apply_online_state_change(state);
                        }
                    }
                }),
            );
            RemoteStoreInner {
                state: Mutex::new(RemoteStoreState::default()),
                database_id,
                queue: queue.clone(),
                watch_stream: ListenStream::new(
                    queue.clone(),
                    Arc::clone(&connection),
                    Arc::clone(&credentials),
                    retry,
                    serializer.clone(),
                    watch_listener,
                ),
                write_stream: WriteStream::new(
                    queue.clone(),
                    connection,
                    credentials,
                    retry,
                    serializer,
                    write_listener,
                ),
                online_state,
                connectivity,
                syncer: OnceLock::new(),
            }
        });
        Self { inner }
    }

    /// Attaches the sync engine. Must be called once before [`RemoteStore::start`].
    pub fn set_remote_syncer(&self, syncer: Weak<dyn RemoteSyncer>) -> FirestoreResult<()> {
        self.inner
            .syncer
            .set(syncer)
            .map_err(|_| failed_precondition("RemoteStore already has a syncer"))
    }

    /// Subscribes to connectivity changes and brings the network up.
    pub async fn start(&self) -> FirestoreResult<()> {
        let weak = Arc::downgrade(&self.inner);
        let queue = self.inner.queue.clone();
        self.inner.connectivity.add_callback(Arc::new(move |status| {
            if status != NetworkStatus::Available {
                return;
            }
            let weak = weak.clone();
            queue.enqueue_and_forget(async move {
                match weak.upgrade() {
                    Some(inner) => inner.on_network_available().await,
                    None => Ok(()),
                }
            });
        }));
        self.inner.enable_network_internal().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
            state.offline_causes.remove(&OfflineCause::PersistenceFailure);
        }
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and reports `Offline` until re-enabled. Pending
    /// writes stay in the mutation queue and are resent later.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await?;
        self.inner.online_state.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("RemoteStore shutting down");
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await?;
        self.inner.connectivity.shutdown();
        self.inner.online_state.set(OnlineState::Unknown);
        Ok(())
    }

    /// Starts listening to `target_data`, opening the watch stream if needed.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls pending batches from the syncer until the pipeline is full.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams under the new user's credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    /// Takes the network down after the local store failed to persist.
    pub async fn handle_persistence_failure(&self, error: &FirestoreError) -> FirestoreResult<()> {
        self.inner.disable_network_until_recovery(error).await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub async fn listen_target(&self, target_id: i32) -> Option<TargetData> {
        self.inner.state.lock().await.listen_targets.get(&target_id).cloned()
    }

    pub async fn write_pipeline_len(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    database_id: DatabaseId,
    queue: AsyncQueue,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state: OnlineStateTracker,
    connectivity: Arc<dyn ConnectivityMonitor>,
    syncer: OnceLock<Weak<dyn RemoteSyncer>>,
}

impl RemoteStoreInner {
    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| failed_precondition("RemoteStore has no syncer attached"))
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.watch_stream.stream().is_started()
            && !state.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.write_stream.stream().is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        let (can_use_network, start_watch) = {
            let mut state = self.state.lock().await;
            let start_watch = self.should_start_watch_stream(&state);
            if start_watch {
                state.watch_change_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
            }
            (state.can_use_network(), start_watch)
        };
        if !can_use_network {
            return Ok(());
        }
        if start_watch {
            self.start_watch_stream();
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) -> FirestoreResult<()> {
        self.write_stream.stream().stop().await?;
        self.watch_stream.stream().stop().await?;

        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_change_aggregator = None;
        Ok(())
    }

    /// Stops and restarts both streams without any backoff delay.
    async fn restart_network(&self) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal().await?;
        for stream in [self.watch_stream.stream(), self.write_stream.stream()] {
            if !stream.is_started() {
                stream.inhibit_backoff()?;
            }
        }
        self.online_state.set(OnlineState::Unknown);
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal().await
    }

    async fn on_network_available(&self) -> FirestoreResult<()> {
        if !self.state.lock().await.can_use_network() {
            return Ok(());
        }
        log::debug!("network became available; restarting streams");
        self.watch_stream.stream().skip_backoff();
        self.write_stream.stream().skip_backoff();
        self.restart_network().await
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        if !self.state.lock().await.can_use_network() {
            return syncer.handle_credential_change(user).await;
        }
        log::debug!("RemoteStore restarting streams for new credentials");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await?;
        self.online_state.set(OnlineState::Unknown);
        syncer.handle_credential_change(user).await?;
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    /// Local persistence failed. The network stays off until `enable_network`
    /// is called again.
    async fn disable_network_until_recovery(&self, error: &FirestoreError) -> FirestoreResult<()> {
        log::warn!("disabling network after a local persistence failure: {error}");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::PersistenceFailure);
        self.disable_network_internal().await?;
        self.online_state.set(OnlineState::Offline);
        Ok(())
    }

    async fn check_syncer_result(&self, result: FirestoreResult<()>) -> FirestoreResult<()> {
        match result {
            Err(err) if err.code == FirestoreErrorCode::Unavailable => {
                self.disable_network_until_recovery(&err).await?;
                Err(err)
            }
            other => other,
        }
    }

    // Watch stream.

    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        let (start_watch, send_now) = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
            let start_watch = self.should_start_watch_stream(&state);
            if start_watch {
                state.watch_change_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
            }
            (start_watch, !start_watch && self.watch_stream.stream().is_open())
        };
        if start_watch {
            self.start_watch_stream();
        } else if send_now {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        let watch_open = self.watch_stream.stream().is_open();
        let (no_targets, can_use_network) = {
            let mut state = self.state.lock().await;
            state.listen_targets.remove(&target_id);
            if watch_open {
                if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                    aggregator.record_pending_target_request(target_id);
                }
            }
            (state.listen_targets.is_empty(), state.can_use_network())
        };
        if watch_open {
            self.watch_stream.unwatch(target_id).await?;
        }
        if no_targets {
            if watch_open {
                self.watch_stream.stream().mark_idle();
            } else if can_use_network {
                // Nothing to listen to, so the state can no longer be known.
                self.online_state.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    fn start_watch_stream(&self) {
        self.watch_stream.stream().start();
        self.online_state.handle_watch_stream_start();
    }

    /// Sends `addTarget`. With a resume token or read time the backend only
    /// sends changes, so the cached count lets it detect missed deletes.
    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_data.target_id);
            }
        }
        let target_data = if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let count = self.syncer()?.get_remote_keys_for_target(target_data.target_id).len();
            target_data.with_expected_count(count as i32)
        } else {
            target_data
        };
        self.watch_stream.watch(&target_data).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange, cause: FirestoreError) -> FirestoreResult<()> {
        let removed: Vec<i32> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            change
                .target_ids
                .iter()
                .copied()
                .filter(|target_id| {
                    let known = state.listen_targets.remove(target_id).is_some();
                    if known {
                        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                            aggregator.remove_target(*target_id);
                        }
                    }
                    known
                })
                .collect()
        };
        let syncer = self.syncer()?;
        for target_id in removed {
            log::debug!("target {target_id} rejected by the backend: {cause}");
            let result = syncer.reject_listen(target_id, cause.clone()).await;
            self.check_syncer_result(result).await?;
        }
        Ok(())
    }

    /// Turns everything aggregated so far into a remote event at `version`,
    /// re-listens mismatched targets and hands the event to the syncer.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(!snapshot_version.is_min(), || {
            "Can't raise event for unknown SnapshotVersion".to_string()
        })?;
        let syncer = self.syncer()?;
        let (event, resets) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargetsMetadata {
                listen_targets: &state.listen_targets,
                syncer: syncer.as_ref(),
            };
            let event = aggregator.create_remote_event(snapshot_version, &provider);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                    *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut resets = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.get_mut(target_id) else {
                    continue;
                };
                // Re-listen from scratch so the backend sends the full result.
                *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                aggregator.record_pending_target_request(*target_id);
                resets.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, resets)
        };

        for target_data in resets {
            log::debug!("re-listening to target {} ({:?})", target_data.target_id, target_data.purpose);
            self.watch_stream.unwatch(target_data.target_id).await?;
            self.send_watch_request(target_data).await?;
        }
        let result = syncer.apply_remote_event(event).await;
        self.check_syncer_result(result).await
    }

    // Write stream.

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        loop {
            let (can_add, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    state.can_use_network() && state.write_pipeline.len() < MAX_PENDING_WRITES,
                    state.write_pipeline.back().map(|batch| batch.batch_id),
                )
            };
            if !can_add {
                break;
            }
            match syncer.next_mutation_batch(last_batch_id).await {
                Ok(Some(batch)) => self.add_to_write_pipeline(batch).await?,
                Ok(None) => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.stream().mark_idle();
                    }
                    break;
                }
                Err(err) => return self.check_syncer_result(Err(err)).await,
            }
        }

        let start_write = {
            let state = self.state.lock().await;
            self.should_start_write_stream(&state)
        };
        if start_write {
            self.write_stream.stream().start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        self.state.lock().await.write_pipeline.push_back(batch.clone());
        if self.write_stream.stream().is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            // Transient: the restarted stream resends the whole pipeline.
            return Ok(());
        }
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Ok(());
        };
        // A bad request is no sign of an overloaded backend.
        self.write_stream.stream().inhibit_backoff()?;
        log::warn!("write batch {} rejected: {error}", batch.batch_id);
        let result = self.syncer()?.reject_failed_write(batch.batch_id, error).await;
        self.check_syncer_result(result).await?;
        self.fill_write_pipeline().await
    }

    fn handle_handshake_error(&self, error: &FirestoreError) {
        if is_permanent_error(error.code) {
            // The token may be what the backend objects to.
            log::debug!("write handshake failed ({error}); resetting stream token");
            self.write_stream.set_last_stream_token(Vec::new());
        }
    }
}

#[async_trait]
impl WatchStreamListener for RemoteStoreInner {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self.state.lock().await.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        // Any message proves the backend is reachable.
        self.online_state.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed {
                if let Some(cause) = target_change.cause.clone() {
                    return self.handle_target_error(target_change, cause).await;
                }
            }
        }

        let syncer = self.syncer()?;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargetsMetadata {
                listen_targets: &state.listen_targets,
                syncer: syncer.as_ref(),
            };
            match change {
                WatchChange::Document(change) => aggregator.handle_document_change(change, &provider),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&filter, &provider)?,
                WatchChange::TargetChange(change) => aggregator.handle_target_change(&change, &provider)?,
            }
        }

        if !snapshot_version.is_min() && snapshot_version >= syncer.last_remote_snapshot_version() {
            self.raise_watch_snapshot(snapshot_version).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let start_again = {
            let mut state = self.state.lock().await;
            if error.is_none() {
                hard_assert(!self.should_start_watch_stream(&state), || {
                    "Watch stream was stopped gracefully while still needed".to_string()
                })?;
            }
            state.watch_change_aggregator = None;
            let start_again = self.should_start_watch_stream(&state);
            if start_again {
                state.watch_change_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
            }
            start_again
        };

        if start_again {
            let reason = error.as_ref().map(ToString::to_string).unwrap_or_default();
            self.online_state.handle_watch_stream_failure(&reason);
            self.start_watch_stream();
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
        Ok(())
    }
}

#[async_trait]
impl WriteStreamListener for RemoteStoreInner {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        let batches: Vec<MutationBatch> = self.state.lock().await.write_pipeline.iter().cloned().collect();
        for batch in batches {
            self.write_stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let batch = batch.ok_or_else(|| {
            crate::firestore::error::internal_error("Got result for empty write pipeline")
        })?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        let applied = self.syncer()?.apply_successful_write(result).await;
        self.check_syncer_result(applied).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let pipeline_empty = {
            let state = self.state.lock().await;
            if error.is_none() {
                hard_assert(!self.should_start_write_stream(&state), || {
                    "Write stream was stopped gracefully while still needed".to_string()
                })?;
            }
            state.write_pipeline.is_empty()
        };

        if let Some(error) = error {
            if !pipeline_empty {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(&error);
                }
            }
        }

        let start_again = {
            let state = self.state.lock().await;
            self.should_start_write_stream(&state)
        };
        if start_again {
            self.write_stream.stream().start();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::error::invalid_argument;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{Mutation, Timestamp};
    use crate::firestore::remote::connection::EmptyCredentialsProvider;
    use crate::firestore::remote::connectivity_monitor::NoopConnectivityMonitor;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::remote::stream::{loopback, LoopbackServer, ServerEvent, ServerStream};
    use crate::firestore::remote::streams::{
        decode_listen_request, decode_write_request, encode_write_response, ListenRequest,
    };
    use crate::firestore::model::MutableDocument;
    use crate::firestore::remote::watch_change::{
        encode_watch_change, DocumentWatchChange, ExistenceFilterChange,
    };
    use crate::firestore::value::MapValue;
    use crate::platform::runtime;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct TestSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        rejected_listens: StdMutex<Vec<i32>>,
        acknowledged: StdMutex<Vec<MutationBatchResult>>,
        rejected_writes: StdMutex<Vec<(i32, FirestoreErrorCode)>>,
        batches: StdMutex<Vec<MutationBatch>>,
        remote_keys: StdMutex<BTreeMap<i32, BTreeSet<DocumentKey>>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl RemoteSyncer for TestSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.events.lock().unwrap().push(event);
                Ok(())
            })
        }

        fn reject_listen(&self, target_id: i32, _error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.rejected_listens.lock().unwrap().push(target_id);
                Ok(())
            })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let batch_id = result.batch.batch_id;
                self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
                self.acknowledged.lock().unwrap().push(result);
                Ok(())
            })
        }

        fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.batches.lock().unwrap().retain(|batch| batch.batch_id != batch_id);
                self.rejected_writes.lock().unwrap().push((batch_id, error.code));
                Ok(())
            })
        }

        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.lock().unwrap().get(&target_id).cloned().unwrap_or_default()
        }

        fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
            box_remote_store_future(async move {
                let after = after_batch_id.unwrap_or(-1);
                Ok(self
                    .batches
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|batch| batch.batch_id > after)
                    .cloned())
            })
        }

        fn last_remote_snapshot_version(&self) -> SnapshotVersion {
            SnapshotVersion::min()
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        store: RemoteStore,
        syncer: Arc<TestSyncer>,
        server: LoopbackServer,
        serializer: JsonProtoSerializer,
    }

    async fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let (connection, server) = loopback();
        let database_id = DatabaseId::new("p", "(default)");
        let store = RemoteStore::new(
            database_id.clone(),
            queue.clone(),
            Arc::new(connection),
            Arc::new(EmptyCredentialsProvider),
            RetrySettings::default(),
            Arc::new(NoopConnectivityMonitor),
        );
        let syncer = Arc::new(TestSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&(syncer.clone() as Arc<dyn RemoteSyncer>));
        store.set_remote_syncer(weak).unwrap();
        let started = store.clone();
        queue.enqueue(async move { started.start().await }).await.unwrap();
        Fixture {
            queue,
            store,
            syncer,
            server,
            serializer: JsonProtoSerializer::new(database_id),
        }
    }

    async fn accept_stream(server: &LoopbackServer) -> ServerStream {
        match server.accept().await {
            Some(ServerEvent::Stream(stream)) => stream,
            _ => panic!("expected a stream"),
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

    fn rooms_target(target_id: i32) -> TargetData {
        TargetData::new(
            Query::collection("rooms").unwrap().to_target(),
            target_id,
            TargetPurpose::Listen,
            1,
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    async fn listen(fixture: &Fixture, target_data: TargetData) {
        let store = fixture.store.clone();
        fixture
            .queue
            .enqueue(async move { store.listen(target_data).await })
            .await
            .unwrap();
    }

    async fn send_change(fixture: &Fixture, stream: &ServerStream, change: WatchChange) {
        stream
            .send(encode_watch_change(&fixture.serializer, &change))
            .await
            .unwrap();
    }

    fn global_snapshot(micros: i64) -> WatchChange {
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())
                .with_read_time(SnapshotVersion::from_micros(micros)),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raises_event_only_at_global_snapshot() {
        let fixture = fixture().await;
        listen(&fixture, rooms_target(2)).await;
        let stream = accept_stream(&fixture.server).await;
        let request = stream.next().await.unwrap();
        assert!(matches!(
            decode_listen_request(&fixture.serializer, &request).unwrap(),
            ListenRequest::AddTarget { target_id: 2, .. }
        ));

        send_change(&fixture, &stream, WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![2]))).await;
        let doc = MutableDocument::new_found_document(
            key("rooms/a"),
            SnapshotVersion::from_micros(1_000_000),
            MapValue::empty(),
        );
        send_change(
            &fixture,
            &stream,
            WatchChange::Document(DocumentWatchChange {
                updated_target_ids: vec![2],
                removed_target_ids: Vec::new(),
                key: key("rooms/a"),
                new_doc: Some(doc),
            }),
        )
        .await;
        send_change(
            &fixture,
            &stream,
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(b"r1".to_vec()),
            ),
        )
        .await;
        eventually(|| fixture.store.online_state() == OnlineState::Online).await;
        assert!(fixture.syncer.events.lock().unwrap().is_empty());

        send_change(&fixture, &stream, global_snapshot(2_000_000)).await;
        eventually(|| fixture.syncer.events.lock().unwrap().len() == 1).await;
        let event = fixture.syncer.events.lock().unwrap()[0].clone();
        assert!(event.document_updates.contains_key(&key("rooms/a")));
        assert!(event.target_changes[&2].current);

        let stored = fixture.store.listen_target(2).await.unwrap();
        assert_eq!(stored.resume_token, b"r1".to_vec());
        assert_eq!(stored.snapshot_version, SnapshotVersion::from_micros(2_000_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existence_filter_mismatch_relistens_target() {
        let fixture = fixture().await;
        fixture.syncer.remote_keys.lock().unwrap().insert(
            2,
            ["rooms/a", "rooms/b", "rooms/c", "rooms/d"].iter().map(|path| key(path)).collect(),
        );
        listen(&fixture, rooms_target(2)).await;
        let stream = accept_stream(&fixture.server).await;
        let _add = stream.next().await.unwrap();
        send_change(&fixture, &stream, WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![2]))).await;
        send_change(
            &fixture,
            &stream,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 5,
                unchanged_names: None,
            }),
        )
        .await;
        send_change(&fixture, &stream, global_snapshot(3_000_000)).await;

        let remove = stream.next().await.unwrap();
        assert_eq!(
            decode_listen_request(&fixture.serializer, &remove).unwrap(),
            ListenRequest::RemoveTarget(2)
        );
        let ListenRequest::AddTarget {
            target_id,
            resume_token,
            expected_count,
            label,
            ..
        } = decode_listen_request(&fixture.serializer, &stream.next().await.unwrap()).unwrap()
        else {
            panic!("expected re-listen");
        };
        assert_eq!(target_id, 2);
        assert!(resume_token.is_empty());
        assert_eq!(expected_count, None);
        assert_eq!(label.as_deref(), Some("existence-filter-mismatch"));

        eventually(|| fixture.syncer.events.lock().unwrap().len() == 1).await;
        let event = fixture.syncer.events.lock().unwrap()[0].clone();
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_target_is_reported_to_syncer() {
        let fixture = fixture().await;
        listen(&fixture, rooms_target(2)).await;
        let stream = accept_stream(&fixture.server).await;
        let _add = stream.next().await.unwrap();
        send_change(
            &fixture,
            &stream,
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Removed, vec![2])
                    .with_cause(crate::firestore::error::permission_denied("no access")),
            ),
        )
        .await;
        eventually(|| *fixture.syncer.rejected_listens.lock().unwrap() == vec![2]).await;
        assert!(fixture.store.listen_target(2).await.is_none());
    }

    fn batch(batch_id: i32, path: &str) -> MutationBatch {
        MutationBatch::new(
            batch_id,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key(path), MapValue::empty())],
        )
    }

    async fn fill(fixture: &Fixture) {
        let store = fixture.store.clone();
        fixture
            .queue
            .enqueue(async move { store.fill_write_pipeline().await })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_pipeline_handshakes_then_acknowledges_in_order() {
        let fixture = fixture().await;
        fixture
            .syncer
            .batches
            .lock()
            .unwrap()
            .extend([batch(1, "rooms/a"), batch(2, "rooms/b")]);
        fill(&fixture).await;
        assert_eq!(fixture.store.write_pipeline_len().await, 2);

        let stream = accept_stream(&fixture.server).await;
        let handshake = decode_write_request(&fixture.serializer, &stream.next().await.unwrap()).unwrap();
        assert!(handshake.is_handshake());
        stream
            .send(encode_write_response(&fixture.serializer, b"t0", None, &[]))
            .await
            .unwrap();

        let first = decode_write_request(&fixture.serializer, &stream.next().await.unwrap()).unwrap();
        assert_eq!(first.stream_token, b"t0".to_vec());
        assert_eq!(first.writes[0].key(), &key("rooms/a"));
        let second = decode_write_request(&fixture.serializer, &stream.next().await.unwrap()).unwrap();
        assert_eq!(second.writes[0].key(), &key("rooms/b"));

        let commit = SnapshotVersion::from_micros(9_000_000);
        let result = MutationResult {
            version: commit,
            transform_results: Vec::new(),
        };
        stream
            .send(encode_write_response(&fixture.serializer, b"t1", Some(commit), &[result]))
            .await
            .unwrap();
        eventually(|| fixture.syncer.acknowledged.lock().unwrap().len() == 1).await;
        let acknowledged = fixture.syncer.acknowledged.lock().unwrap()[0].clone();
        assert_eq!(acknowledged.batch.batch_id, 1);
        assert_eq!(acknowledged.commit_version, commit);
        assert_eq!(acknowledged.stream_token, b"t1".to_vec());
        assert_eq!(fixture.store.write_pipeline_len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_write_error_rejects_only_the_head_batch() {
        let fixture = fixture().await;
        fixture
            .syncer
            .batches
            .lock()
            .unwrap()
            .extend([batch(1, "rooms/a"), batch(2, "rooms/b")]);
        fill(&fixture).await;

        let stream = accept_stream(&fixture.server).await;
        let _handshake = stream.next().await.unwrap();
        stream
            .send(encode_write_response(&fixture.serializer, b"t0", None, &[]))
            .await
            .unwrap();
        let _first = stream.next().await.unwrap();
        let _second = stream.next().await.unwrap();
        stream.fail(invalid_argument("bad write")).await;

        eventually(|| fixture.syncer.rejected_writes.lock().unwrap().len() == 1).await;
        assert_eq!(
            fixture.syncer.rejected_writes.lock().unwrap()[0],
            (1, FirestoreErrorCode::InvalidArgument)
        );

        // The stream restarts without backoff and resends the remaining batch.
        let restarted = accept_stream(&fixture.server).await;
        assert!(decode_write_request(&fixture.serializer, &restarted.next().await.unwrap())
            .unwrap()
            .is_handshake());
        restarted
            .send(encode_write_response(&fixture.serializer, b"t1", None, &[]))
            .await
            .unwrap();
        let resent = decode_write_request(&fixture.serializer, &restarted.next().await.unwrap()).unwrap();
        assert_eq!(resent.writes[0].key(), &key("rooms/b"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disable_network_goes_offline_and_clears_pipeline() {
        let fixture = fixture().await;
        fixture.syncer.batches.lock().unwrap().push(batch(1, "rooms/a"));
        fill(&fixture).await;
        let _stream = accept_stream(&fixture.server).await;

        let store = fixture.store.clone();
        fixture
            .queue
            .enqueue(async move { store.disable_network().await })
            .await
            .unwrap();
        assert_eq!(fixture.store.online_state(), OnlineState::Offline);
        assert_eq!(fixture.store.write_pipeline_len().await, 0);
        assert_eq!(
            fixture.syncer.online_states.lock().unwrap().last(),
            Some(&OnlineState::Offline)
        );

        let store = fixture.store.clone();
        fixture
            .queue
            .enqueue(async move { store.enable_network().await })
            .await
            .unwrap();
        assert_eq!(fixture.store.write_pipeline_len().await, 1);
    }
}
