use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::constants::{BATCH_ID_UNKNOWN, RESUME_TOKEN_MAX_AGE};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::user::User;
use crate::firestore::error::{hard_assert, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::local_serializer::{LocalSerializer, MutationQueueMetadata};
use crate::firestore::local::lru_garbage_collector::{LruDelegate, LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{
    PersistenceBackend, PersistenceTransaction, TargetGlobals, DOCUMENT_OVERLAYS_PREFIX, MUTATIONS_PREFIX,
    MUTATION_QUEUE_KEY, REMOTE_DOCUMENTS_PREFIX, TARGETS_PREFIX, TARGET_DOCUMENTS_PREFIX, TARGET_GLOBALS_KEY,
};
use crate::firestore::local::query_engine::{QueryEngine, QueryEngineSettings};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldIndex, IndexOffset, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Result of a local write: the new batch and the resulting local documents.
#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: DocumentMap,
}

/// Documents matching a query plus the keys the backend last reported for it.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Batches that disappeared and appeared when the active user changed.
#[derive(Debug, Clone, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
}

/// Keys a view started or stopped displaying.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Local persistent state: remote documents, targets, the current user's
/// mutation queue and overlays.
///
/// Every mutating operation records its writes in a [`PersistenceTransaction`]
/// and commits them to the backend in one atomic batch. A failed commit
/// surfaces as `Unavailable` and the caches are reloaded from the last
/// committed state, so nothing from the failed operation stays visible.
pub struct LocalStore {
    persistence: Arc<dyn PersistenceBackend>,
    serializer: LocalSerializer,
    shared_namespace: String,
    user: User,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
    query_engine: QueryEngine,
    /// Documents currently displayed by a view, pinned against collection.
    local_view_references: ReferenceSet,
    active_targets: BTreeMap<i32, TargetData>,
    active_target_ids_by_canonical_id: HashMap<String, i32>,
    document_sequence_numbers: BTreeMap<DocumentKey, i64>,
    current_sequence_number: i64,
    /// Set when a rollback could not read the committed state back.
    needs_reload: bool,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("namespace", &self.shared_namespace)
            .field("user", &self.user)
            .field("documents", &self.remote_documents.len())
            .field("targets", &self.target_cache.get_target_count())
            .field("active_targets", &self.active_targets.len())
            .finish()
    }
}

impl LocalStore {
    /// Loads the persisted caches for `database_id` and `user`.
    pub fn open(
        persistence: Arc<dyn PersistenceBackend>,
        database_id: DatabaseId,
        user: User,
        query_engine_settings: QueryEngineSettings,
    ) -> FirestoreResult<Self> {
        let shared_namespace = database_id.persistence_key();
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(database_id));
        let (remote_documents, target_cache) =
            Self::read_shared_state(persistence.as_ref(), &serializer, &shared_namespace)?;

        let current_sequence_number = target_cache.highest_sequence_number();
        let mut index_manager = IndexManager::new();
        index_manager.rebuild(remote_documents.documents());
        let document_sequence_numbers = remote_documents
            .keys()
            .map(|key| (key.clone(), current_sequence_number))
            .collect();
        let mut store = Self {
            persistence,
            serializer,
            shared_namespace,
            user: user.clone(),
            remote_documents,
            target_cache,
            mutation_queue: MutationQueue::new(),
            overlays: DocumentOverlayCache::new(),
            index_manager,
            query_engine: QueryEngine::new(query_engine_settings),
            local_view_references: ReferenceSet::new(),
            active_targets: BTreeMap::new(),
            active_target_ids_by_canonical_id: HashMap::new(),
            document_sequence_numbers,
            current_sequence_number,
            needs_reload: false,
        };
        store.load_user_state(&user)?;
        log::debug!(
            "opened local store for {user}: {} documents, {} targets, {} pending batches",
            store.remote_documents.len(),
            store.target_cache.get_target_count(),
            store.mutation_queue.get_all_mutation_batches().len()
        );
        Ok(store)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Local state of `key`: the overlay applied onto the cached remote document.
    pub fn get_document(&mut self, key: &DocumentKey) -> MutableDocument {
        self.documents_view().get_document(key)
    }

    pub fn get_documents(&mut self, keys: &BTreeSet<DocumentKey>) -> DocumentMap {
        self.documents_view().get_documents(keys)
    }

    /// Queues `mutations` as a new batch and applies them optimistically.
    pub fn local_write(&mut self, mutations: Vec<Mutation>, local_write_time: Timestamp) -> FirestoreResult<LocalWriteResult> {
        let mut txn = self.start_transaction("Locally write mutations")?;
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let remote_docs = self.remote_documents.get_entries(&keys);
        let documents_without_remote_version: BTreeSet<DocumentKey> = remote_docs
            .iter()
            .filter(|(_, doc)| !doc.is_valid_document())
            .map(|(key, _)| key.clone())
            .collect();

        let mut overlayed = LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        )
        .get_local_view_of_documents(&mut txn, remote_docs, &BTreeSet::new());

        // Pin the current value of non-idempotent transforms so re-applying the
        // batch later yields the same local result.
        let base_mutations: Vec<Mutation> = mutations
            .iter()
            .filter_map(|mutation| {
                overlayed
                    .get(mutation.key())
                    .and_then(|doc| mutation.extract_transform_base_value(&doc.document))
            })
            .collect();

        let batch = self
            .mutation_queue
            .add_mutation_batch(&mut txn, local_write_time, base_mutations, mutations)?;
        for key in &keys {
            self.index_manager
                .add_to_collection_parent_index(&key.collection_path());
        }
        let overlays = batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
        self.overlays.save_overlays(&mut txn, batch.batch_id, &overlays);
        self.commit(txn)?;

        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes: overlayed
                .into_iter()
                .map(|(key, doc)| (key, doc.document))
                .collect(),
        })
    }

    /// Merges a watch snapshot into the caches and returns the local view of
    /// every changed document.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut txn = self.start_transaction("Apply remote event")?;
        let sequence_number = txn.sequence_number();
        let remote_version = event.snapshot_version;
        let previous_targets = self.active_targets.clone();

        for (&target_id, change) in &event.target_changes {
            let Some(old) = self.active_targets.get(&target_id).cloned() else {
                continue;
            };
            self.target_cache
                .remove_matching_keys(&mut txn, &change.removed_documents, target_id);
            self.target_cache
                .add_matching_keys(&mut txn, change.added_documents.iter().cloned(), target_id);
            for key in change.removed_documents.iter().chain(&change.added_documents) {
                self.touch_document(key, sequence_number);
            }

            let mut updated = old.with_sequence_number(sequence_number);
            if event.target_mismatches.contains_key(&target_id) {
                updated = updated
                    .with_resume_token(Vec::new(), SnapshotVersion::min())
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
            } else if !change.resume_token.is_empty() {
                updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
            }
            if Self::should_persist_target_data(&old, &updated, change) {
                self.target_cache.update_target_data(&mut txn, updated.clone())?;
            }
            self.active_targets.insert(target_id, updated);
        }

        let mut changed_docs = DocumentMap::new();
        let mut existence_changed = BTreeSet::new();
        for (key, doc) in &event.document_updates {
            let existing = self.remote_documents.get_entry(key);
            if doc.is_found_document() != existing.is_found_document() {
                existence_changed.insert(key.clone());
            }
            if doc.is_no_document() && doc.version().is_min() {
                // A deleted document at version zero is forgotten entirely.
                self.remote_documents.remove_entry(&mut txn, key);
                self.index_manager.remove_index_entries(key);
                changed_docs.insert(key.clone(), doc.clone());
            } else if !existing.is_valid_document()
                || doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
            {
                let read_time = if doc.read_time().is_min() {
                    remote_version
                } else {
                    doc.read_time()
                };
                self.remote_documents.add_entry(&mut txn, doc.clone(), read_time)?;
                let stored = self.remote_documents.get_entry(key);
                self.index_manager
                    .add_to_collection_parent_index(&key.collection_path());
                self.index_manager.update_index_entries([&stored]);
                changed_docs.insert(key.clone(), stored);
            } else {
                log::debug!(
                    "ignoring outdated watch update for {key}: current version {}, watch version {}",
                    existing.version(),
                    doc.version()
                );
            }
            self.touch_document(key, sequence_number);
        }

        if !remote_version.is_min() {
            let last = self.target_cache.get_last_remote_snapshot_version();
            hard_assert(remote_version >= last, || {
                format!("Watch stream reverted to previous snapshot?? {remote_version} < {last}")
            })?;
            self.target_cache.set_target_snapshot_version(&mut txn, remote_version);
        }

        let views = LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        )
        .get_local_view_of_documents(&mut txn, changed_docs, &existence_changed);
        if let Err(err) = self.commit(txn) {
            self.active_targets = previous_targets;
            return Err(err);
        }
        Ok(views.into_iter().map(|(key, doc)| (key, doc.document)).collect())
    }

    /// Applies the server's write results, drops the batch and its overlays,
    /// and returns the affected documents.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let mut txn = self.start_transaction("Acknowledge batch")?;
        let sequence_number = txn.sequence_number();
        let batch = &batch_result.batch;
        let affected = batch.keys();

        self.mutation_queue
            .acknowledge_batch(&mut txn, batch, batch_result.stream_token.clone())?;
        for key in &affected {
            let mut doc = self.remote_documents.get_entry(key);
            let ack_version = batch_result
                .doc_versions
                .get(key)
                .copied()
                .ok_or_else(|| internal_error("docVersions should contain every doc in the write."))?;
            if doc.version() < ack_version {
                batch.apply_to_remote_document(&mut doc, batch_result)?;
                if doc.is_valid_document() {
                    self.remote_documents
                        .add_entry(&mut txn, doc, batch_result.commit_version)?;
                    let stored = self.remote_documents.get_entry(key);
                    self.index_manager.update_index_entries([&stored]);
                }
            }
            self.touch_document(key, sequence_number);
        }
        self.mutation_queue.remove_mutation_batch(&mut txn, batch)?;
        self.mutation_queue.perform_consistency_check()?;
        self.overlays
            .remove_overlays_for_batch_id(&mut txn, &affected, batch.batch_id);

        // Transform results replace the locally estimated values.
        let transformed: BTreeSet<DocumentKey> = batch
            .mutations
            .iter()
            .zip(&batch_result.mutation_results)
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key().clone())
            .collect();

        let mut view = LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        );
        view.recalculate_and_save_overlays_for_document_keys(&mut txn, &transformed);
        let documents = view.get_documents(&affected);
        self.commit(txn)?;
        log::debug!("acknowledged batch {}", batch.batch_id);
        Ok(documents)
    }

    /// Drops a batch the backend refused and rolls back its overlays.
    pub fn reject_batch(&mut self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        let mut txn = self.start_transaction("Reject batch")?;
        let sequence_number = txn.sequence_number();
        let batch = self
            .mutation_queue
            .lookup_mutation_batch(batch_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
        let affected = batch.keys();
        self.mutation_queue.remove_mutation_batch(&mut txn, &batch)?;
        self.mutation_queue.perform_consistency_check()?;
        self.overlays
            .remove_overlays_for_batch_id(&mut txn, &affected, batch_id);
        for key in &affected {
            self.touch_document(key, sequence_number);
        }

        let mut view = LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        );
        view.recalculate_and_save_overlays_for_document_keys(&mut txn, &affected);
        let documents = view.get_documents(&affected);
        self.commit(txn)?;
        log::debug!("rejected batch {batch_id}");
        Ok(documents)
    }

    /// Returns the cached target data for `target`, allocating a new target id
    /// on first use.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        if let Some(active) = self.active_target_for(&target) {
            return Ok(active.clone());
        }
        let mut txn = self.start_transaction("Allocate target")?;
        let sequence_number = txn.sequence_number();
        let data = match self.target_cache.get_target_data(&target).cloned() {
            Some(cached) => {
                let data = cached.with_sequence_number(sequence_number);
                self.target_cache.update_target_data(&mut txn, data.clone())?;
                data
            }
            None => {
                let target_id = self.target_cache.allocate_target_id();
                let data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                self.target_cache.add_target_data(&mut txn, data.clone())?;
                data
            }
        };
        self.commit(txn)?;
        self.active_target_ids_by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        self.active_targets.insert(data.target_id, data.clone());
        Ok(data)
    }

    /// Stops tracking `target_id` as active. Unless `keep_persisted_target_data`
    /// is set, the target stays cached until garbage collection removes it.
    pub fn release_target(&mut self, target_id: i32, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let data = self
            .active_targets
            .remove(&target_id)
            .ok_or_else(|| internal_error(format!("Tried to release nonexistent target: {target_id}")))?;
        self.active_target_ids_by_canonical_id
            .remove(&data.target.canonical_id());
        // The view is gone either way. Only the persisted sequence number can
        // fail to update.
        let sequence_number = self.next_sequence_number();
        for key in self.local_view_references.remove_references_for_id(target_id) {
            self.touch_document(&key, sequence_number);
        }

        let mut txn = self.start_transaction("Release target")?;
        if !keep_persisted_target_data && self.target_cache.get_target_data_by_id(target_id).is_some() {
            let released = data.with_sequence_number(txn.sequence_number());
            self.target_cache.update_target_data(&mut txn, released)?;
        }
        self.commit(txn)
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.active_target_for(target)
            .or_else(|| self.target_cache.get_target_data(target))
            .cloned()
    }

    /// Runs `query` against the local cache. With `use_previous_results`, the
    /// target's last synced results seed the answer.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target());
        let (last_limbo_free, remote_keys) = match &target_data {
            Some(data) => (
                data.last_limbo_free_snapshot_version,
                self.target_cache.get_matching_keys_for_target_id(data.target_id),
            ),
            None => (SnapshotVersion::min(), BTreeSet::new()),
        };
        let no_keys = BTreeSet::new();
        let view = LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        );
        let result = self.query_engine.get_documents_matching_query(
            &view,
            &self.index_manager,
            query,
            if use_previous_results {
                last_limbo_free
            } else {
                SnapshotVersion::min()
            },
            if use_previous_results { &remote_keys } else { &no_keys },
        );
        if let Some(target) = &result.index_to_create {
            if let Some(index) = IndexManager::index_for_target(target) {
                self.add_field_index(index);
            }
        }
        Ok(QueryResult {
            documents: result.documents,
            remote_keys,
        })
    }

    /// Registers a client-side field index and backfills it from the cache.
    pub fn add_field_index(&mut self, index: FieldIndex) -> Option<i32> {
        let collection_group = index.collection_group.clone();
        let index_id = self.index_manager.add_field_index(index)?;
        let documents =
            self.remote_documents
                .get_all_from_collection_group(&collection_group, &IndexOffset::min(), usize::MAX);
        self.index_manager.update_index_entries(&documents);
        log::debug!(
            "backfilled index {index_id} on {collection_group} with {} documents",
            documents.len()
        );
        Some(index_id)
    }

    pub fn delete_all_field_indexes(&mut self) {
        self.index_manager.delete_all_field_indexes();
    }

    pub fn field_index_count(&self) -> usize {
        self.index_manager.field_index_count()
    }

    /// Pins documents shown by views and records limbo-free snapshots.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) {
        let sequence_number = self.next_sequence_number();
        for change in changes {
            self.local_view_references
                .add_references(change.added_keys.iter().cloned(), change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            for key in &change.removed_keys {
                self.touch_document(key, sequence_number);
            }
            if change.from_cache {
                continue;
            }
            if let Some(data) = self.active_targets.get_mut(&change.target_id) {
                *data = data.with_last_limbo_free_snapshot_version(data.snapshot_version);
            }
        }
    }

    /// Oldest batch with an id above `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> Option<MutationBatch> {
        if self.needs_reload {
            return None;
        }
        self.mutation_queue
            .get_next_mutation_batch_after_batch_id(after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
            .cloned()
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.mutation_queue.get_highest_unacknowledged_batch_id()
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_cache.get_last_remote_snapshot_version()
    }

    pub fn get_remote_document_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.target_cache.get_matching_keys_for_target_id(target_id)
    }

    pub fn get_last_stream_token(&self) -> Vec<u8> {
        self.mutation_queue.get_last_stream_token().to_vec()
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let mut txn = self.start_transaction("Set last stream token")?;
        self.mutation_queue.set_last_stream_token(&mut txn, stream_token);
        self.commit(txn)
    }

    /// Switches the mutation queue and overlays to `user`.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.mutation_queue.get_all_mutation_batches();
        self.load_user_state(&user)?;
        self.user = user;
        let new_batches = self.mutation_queue.get_all_mutation_batches();

        let changed_keys: BTreeSet<DocumentKey> = old_batches
            .iter()
            .chain(&new_batches)
            .flat_map(|batch| batch.keys())
            .collect();
        let affected_documents = self.documents_view().get_documents(&changed_keys);
        log::debug!(
            "switched local store to {}: {} batches removed, {} added",
            self.user,
            old_batches.len(),
            new_batches.len()
        );
        Ok(UserChangeResult {
            affected_documents,
            removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
            added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
        })
    }

    /// Runs one LRU pass with the active targets protected.
    pub fn collect_garbage(&mut self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let mut txn = self.start_transaction("Collect garbage")?;
        let active: BTreeSet<i32> = self.active_targets.keys().copied().collect();
        let results = {
            let mut pass = GarbageCollectionPass {
                store: self,
                txn: &mut txn,
            };
            collector.collect(&mut pass, &active)
        };
        self.commit(txn)?;
        Ok(results)
    }

    pub fn remote_document_count(&self) -> usize {
        self.remote_documents.len()
    }

    pub fn cache_size(&self) -> usize {
        self.remote_documents.get_size()
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    pub fn has_overlay(&self, key: &DocumentKey) -> bool {
        self.overlays.get_overlay(key).is_some()
    }

    pub fn contains_remote_document(&self, key: &DocumentKey) -> bool {
        self.remote_documents.contains_key(key)
    }

    fn documents_view(&mut self) -> LocalDocumentsView<'_> {
        LocalDocumentsView::new(
            &self.remote_documents,
            &self.mutation_queue,
            &mut self.overlays,
            &self.index_manager,
        )
    }

    fn active_target_for(&self, target: &Target) -> Option<&TargetData> {
        let target_id = self
            .active_target_ids_by_canonical_id
            .get(&target.canonical_id())?;
        self.active_targets.get(target_id)
    }

    fn read_shared_state(
        persistence: &dyn PersistenceBackend,
        serializer: &LocalSerializer,
        namespace: &str,
    ) -> FirestoreResult<(RemoteDocumentCache, TargetCache)> {
        let mut documents = Vec::new();
        for (_, value) in persistence.scan_prefix(namespace, REMOTE_DOCUMENTS_PREFIX)? {
            documents.push(serializer.decode_remote_document(&value)?);
        }
        let mut targets = Vec::new();
        for (_, value) in persistence.scan_prefix(namespace, TARGETS_PREFIX)? {
            targets.push(serializer.decode_target_data(&value)?);
        }
        let mut matching_keys = Vec::new();
        for (key, value) in persistence.scan_prefix(namespace, TARGET_DOCUMENTS_PREFIX)? {
            let target_id = key
                .trim_start_matches(TARGET_DOCUMENTS_PREFIX)
                .parse::<i32>()
                .map_err(|_| internal_error(format!("Invalid target documents entry: {key}")))?;
            matching_keys.push((target_id, serializer.decode_target_keys(&value)?));
        }
        let globals = match persistence.read(namespace, TARGET_GLOBALS_KEY)? {
            Some(value) => serializer.decode_target_globals(&value)?,
            None => TargetGlobals::default(),
        };
        Ok((
            RemoteDocumentCache::restore(documents),
            TargetCache::restore(targets, matching_keys, globals),
        ))
    }

    /// Replaces the persisted caches with what the backend last committed.
    /// Active targets and view references are in-memory only and are kept.
    fn reload_committed_state(&mut self) -> FirestoreResult<()> {
        let (remote_documents, target_cache) =
            Self::read_shared_state(self.persistence.as_ref(), &self.serializer, &self.shared_namespace)?;
        self.index_manager.rebuild(remote_documents.documents());
        for key in remote_documents.keys() {
            self.document_sequence_numbers
                .entry(key.clone())
                .or_insert(self.current_sequence_number);
        }
        self.remote_documents = remote_documents;
        self.target_cache = target_cache;
        let user = self.user.clone();
        self.load_user_state(&user)?;
        self.needs_reload = false;
        Ok(())
    }

    /// Fails while the caches may still hold state from a failed commit.
    fn ensure_committed_state(&mut self) -> FirestoreResult<()> {
        if !self.needs_reload {
            return Ok(());
        }
        self.reload_committed_state().map_err(|err| {
            log::warn!("local store is still waiting for persistence: {err}");
            unavailable(format!("Local store could not be restored: {}", err.message()))
        })
    }

    fn user_namespace(&self, user: &User) -> String {
        format!("{}/{}", self.shared_namespace, user.storage_key())
    }

    fn load_user_state(&mut self, user: &User) -> FirestoreResult<()> {
        let namespace = self.user_namespace(user);
        let mut batches = Vec::new();
        for (_, value) in self.persistence.scan_prefix(&namespace, MUTATIONS_PREFIX)? {
            batches.push(self.serializer.decode_mutation_batch(&value)?);
        }
        let metadata = match self.persistence.read(&namespace, MUTATION_QUEUE_KEY)? {
            Some(value) => self.serializer.decode_queue_metadata(&value)?,
            None => MutationQueueMetadata::default(),
        };
        let mut overlays = Vec::new();
        for (_, value) in self.persistence.scan_prefix(&namespace, DOCUMENT_OVERLAYS_PREFIX)? {
            overlays.push(self.serializer.decode_overlay(&value)?);
        }
        for batch in &batches {
            for key in batch.keys() {
                self.index_manager
                    .add_to_collection_parent_index(&key.collection_path());
            }
        }
        self.mutation_queue =
            MutationQueue::restore(batches, metadata.highest_batch_id, metadata.last_stream_token);
        self.overlays = DocumentOverlayCache::restore(overlays);
        Ok(())
    }

    fn next_sequence_number(&mut self) -> i64 {
        self.current_sequence_number += 1;
        self.current_sequence_number
    }

    fn start_transaction(&mut self, label: &'static str) -> FirestoreResult<PersistenceTransaction> {
        self.ensure_committed_state()?;
        let sequence_number = self.next_sequence_number();
        Ok(PersistenceTransaction::new(label, sequence_number))
    }

    /// Writes `txn` to the backend. On failure the in-memory caches are rolled
    /// back to the last committed state.
    fn commit(&mut self, txn: PersistenceTransaction) -> FirestoreResult<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let label = txn.label();
        let batch = self.serializer.encode_pending_writes(
            txn.writes(),
            &self.shared_namespace,
            &self.user_namespace(&self.user),
        );
        let Err(err) = self.persistence.commit(batch) else {
            return Ok(());
        };
        log::warn!("failed to persist '{label}': {err}");
        if let Err(reload_err) = self.reload_committed_state() {
            log::warn!("failed to roll back '{label}': {reload_err}");
            self.needs_reload = true;
        }
        Err(unavailable(format!("Failed to persist '{label}': {}", err.message())))
    }

    fn touch_document(&mut self, key: &DocumentKey, sequence_number: i64) {
        self.document_sequence_numbers
            .insert(key.clone(), sequence_number);
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.target_cache.contains_key(key)
            || self.mutation_queue.contains_key(key)
            || self.local_view_references.contains_key(key)
    }

    fn orphaned_documents(&self) -> impl Iterator<Item = (&DocumentKey, i64)> {
        self.document_sequence_numbers
            .iter()
            .filter(|(key, _)| self.remote_documents.contains_key(key) && !self.is_referenced(key))
            .map(|(key, &sequence_number)| (key, sequence_number))
    }

    fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
        if new.resume_token.is_empty() {
            return false;
        }
        if old.resume_token.is_empty() {
            return true;
        }
        let age = new.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
        if age >= RESUME_TOKEN_MAX_AGE.as_micros() as i64 {
            return true;
        }
        change.document_count() > 0
    }
}

struct GarbageCollectionPass<'a> {
    store: &'a mut LocalStore,
    txn: &'a mut PersistenceTransaction,
}

impl LruDelegate for GarbageCollectionPass<'_> {
    fn cache_size(&self) -> usize {
        self.store.remote_documents.get_size()
    }

    fn sequence_number_count(&self) -> usize {
        self.store.target_cache.get_target_count() + self.store.orphaned_documents().count()
    }

    fn for_each_target_sequence_number(&self, f: &mut dyn FnMut(i64)) {
        for data in self.store.target_cache.targets() {
            f(data.sequence_number);
        }
    }

    fn for_each_orphaned_document_sequence_number(&self, f: &mut dyn FnMut(i64)) {
        for (_, sequence_number) in self.store.orphaned_documents() {
            f(sequence_number);
        }
    }

    fn remove_targets(&mut self, upper_bound: i64, active_target_ids: &BTreeSet<i32>) -> usize {
        let last_used: BTreeMap<i32, i64> = self
            .store
            .target_cache
            .targets()
            .map(|data| (data.target_id, data.sequence_number))
            .collect();
        let removed = self
            .store
            .target_cache
            .remove_targets(self.txn, upper_bound, active_target_ids);
        // Documents released by a removed target were last used with it.
        for (target_id, keys) in &removed {
            let sequence_number = last_used.get(target_id).copied().unwrap_or(upper_bound);
            for key in keys {
                let entry = self
                    .store
                    .document_sequence_numbers
                    .entry(key.clone())
                    .or_insert(sequence_number);
                *entry = (*entry).max(sequence_number);
            }
        }
        removed.len()
    }

    fn remove_orphaned_documents(&mut self, upper_bound: i64) -> usize {
        let doomed: Vec<DocumentKey> = self
            .store
            .orphaned_documents()
            .filter(|(_, sequence_number)| *sequence_number <= upper_bound)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.store.remote_documents.remove_entry(self.txn, key);
            self.store.index_manager.remove_index_entries(key);
            self.store.document_sequence_numbers.remove(key);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::lru_garbage_collector::LruParams;
    use crate::firestore::local::persistence::MemoryPersistenceBackend;
    use crate::firestore::model::{FieldPath, MutationResult};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(pairs: &[(&str, i64)]) -> MapValue {
        let mut map = MapValue::empty();
        for (field, value) in pairs {
            map.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(*value));
        }
        map
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn open(backend: Arc<MemoryPersistenceBackend>) -> LocalStore {
        LocalStore::open(
            backend,
            DatabaseId::new("project", "(default)"),
            User::new("alice"),
            QueryEngineSettings::default(),
        )
        .unwrap()
    }

    fn store() -> LocalStore {
        open(Arc::new(MemoryPersistenceBackend::new()))
    }

    fn ack(store: &mut LocalStore, batch_id: i32, commit: i64) -> DocumentMap {
        let batch = store.next_mutation_batch(Some(batch_id - 1)).unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult {
                version: version(commit),
                transform_results: Vec::new(),
            })
            .collect();
        let result = MutationBatchResult::from(batch, version(commit), results, b"token".to_vec()).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    fn remote_event(target_id: i32, snapshot: i64, docs: Vec<MutableDocument>) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: format!("resume-{snapshot}").into_bytes(),
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: version(snapshot),
            ..RemoteEvent::default()
        };
        for doc in docs {
            change.added_documents.insert(doc.key().clone());
            event.document_updates.insert(doc.key().clone(), doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn local_write_is_visible_until_acknowledged() {
        let mut store = store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 1)]))], Timestamp::now())
            .unwrap();
        assert_eq!(result.batch_id, 1);
        let doc = &result.changes[&key("rooms/a")];
        assert!(doc.has_local_mutations());
        assert!(store.has_overlay(&key("rooms/a")));

        let acked = ack(&mut store, 1, 10);
        let doc = &acked[&key("rooms/a")];
        assert!(!doc.has_local_mutations());
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), version(10));
        assert!(!store.has_overlay(&key("rooms/a")));
        assert_eq!(store.get_last_stream_token(), b"token".to_vec());
    }

    #[test]
    fn acknowledging_a_batch_keeps_later_batches() {
        let mut store = store();
        store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 1)]))], Timestamp::now())
            .unwrap();
        store
            .local_write(vec![Mutation::set(key("rooms/b"), data(&[("size", 2)]))], Timestamp::now())
            .unwrap();
        ack(&mut store, 1, 10);
        assert!(store.has_overlay(&key("rooms/b")));
        assert_eq!(store.next_mutation_batch(None).unwrap().batch_id, 2);
        assert!(store.get_document(&key("rooms/b")).has_local_mutations());
    }

    #[test]
    fn rejected_batch_rolls_back_its_overlay() {
        let mut store = store();
        store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 1)]))], Timestamp::now())
            .unwrap();
        let docs = store.reject_batch(1).unwrap();
        assert!(!docs[&key("rooms/a")].is_valid_document());
        assert_eq!(store.overlay_count(), 0);
        assert_eq!(store.get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        assert!(store.reject_batch(1).is_err());
    }

    #[test]
    fn remote_event_ignores_older_versions() {
        let mut store = store();
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let newer = MutableDocument::new_found_document(key("rooms/a"), version(20), data(&[("size", 2)]));
        store
            .apply_remote_event(&remote_event(target.target_id, 20, vec![newer]))
            .unwrap();
        let older = MutableDocument::new_found_document(key("rooms/a"), version(10), data(&[("size", 1)]));
        let changed = store
            .apply_remote_event(&remote_event(target.target_id, 30, vec![older]))
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(store.get_document(&key("rooms/a")).version(), version(20));
        assert_eq!(store.get_last_remote_snapshot_version(), version(30));
        assert_eq!(
            store.get_remote_document_keys(target.target_id),
            [key("rooms/a")].into_iter().collect()
        );
    }

    #[test]
    fn allocating_the_same_target_twice_reuses_its_id() {
        let mut store = store();
        let target = Query::collection("rooms").unwrap().to_target();
        let first = store.allocate_target(target.clone()).unwrap();
        let second = store.allocate_target(target.clone()).unwrap();
        assert_eq!(first.target_id, second.target_id);
        store.release_target(first.target_id, false).unwrap();
        let third = store.allocate_target(target).unwrap();
        assert_eq!(third.target_id, first.target_id);
        assert!(store.release_target(99, false).is_err());
    }

    #[test]
    fn execute_query_merges_pending_writes() {
        let mut store = store();
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let remote = MutableDocument::new_found_document(key("rooms/a"), version(10), data(&[("size", 1)]));
        store
            .apply_remote_event(&remote_event(target.target_id, 10, vec![remote]))
            .unwrap();
        store
            .local_write(vec![Mutation::set(key("rooms/b"), data(&[("size", 2)]))], Timestamp::now())
            .unwrap();
        let result = store
            .execute_query(&Query::collection("rooms").unwrap(), true)
            .unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
        assert_eq!(result.remote_keys, [key("rooms/a")].into_iter().collect());
    }

    #[test]
    fn state_survives_reopen() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        {
            let mut store = open(Arc::clone(&backend));
            let target = store
                .allocate_target(Query::collection("rooms").unwrap().to_target())
                .unwrap();
            let remote = MutableDocument::new_found_document(key("rooms/a"), version(10), data(&[("size", 1)]));
            store
                .apply_remote_event(&remote_event(target.target_id, 10, vec![remote]))
                .unwrap();
            store
                .local_write(vec![Mutation::set(key("rooms/b"), data(&[("size", 2)]))], Timestamp::now())
                .unwrap();
        }
        let mut store = open(backend);
        assert_eq!(store.get_document(&key("rooms/a")).version(), version(10));
        assert!(store.get_document(&key("rooms/b")).has_local_mutations());
        assert_eq!(store.get_last_remote_snapshot_version(), version(10));
        let data = store
            .get_target_data(&Query::collection("rooms").unwrap().to_target())
            .unwrap();
        assert_eq!(data.resume_token, b"resume-10".to_vec());
        let batch = store
            .local_write(vec![Mutation::delete(key("rooms/c"))], Timestamp::now())
            .unwrap();
        assert_eq!(batch.batch_id, 2);
    }

    #[test]
    fn user_change_swaps_mutation_queue() {
        let mut store = store();
        store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 1)]))], Timestamp::now())
            .unwrap();
        let result = store.handle_user_change(User::new("bob")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/a")].is_valid_document());

        let result = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(result.added_batch_ids, vec![1]);
        assert!(store.get_document(&key("rooms/a")).has_local_mutations());
    }

    #[test]
    fn failed_commit_surfaces_unavailable() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let mut store = open(Arc::clone(&backend));
        backend.set_fail_commits(true);
        let err = store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 1)]))], Timestamp::now())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");
    }

    #[test]
    fn failed_write_leaves_no_batch_behind() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let mut store = open(Arc::clone(&backend));
        backend.set_fail_commits(true);
        assert!(store
            .local_write(vec![Mutation::set(key("rooms/ghost"), data(&[("size", 1)]))], Timestamp::now())
            .is_err());
        assert!(store.next_mutation_batch(None).is_none());
        assert_eq!(store.overlay_count(), 0);
        assert!(!store.get_document(&key("rooms/ghost")).has_local_mutations());

        backend.set_fail_commits(false);
        let result = store
            .local_write(vec![Mutation::set(key("rooms/a"), data(&[("size", 2)]))], Timestamp::now())
            .unwrap();
        assert_eq!(result.batch_id, 1);
        let batch = store.next_mutation_batch(None).unwrap();
        assert_eq!(batch.keys().into_iter().collect::<Vec<_>>(), vec![key("rooms/a")]);
    }

    #[test]
    fn failed_remote_event_keeps_the_previous_cache() {
        let backend = Arc::new(MemoryPersistenceBackend::new());
        let mut store = open(Arc::clone(&backend));
        let target = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        store
            .apply_remote_event(&remote_event(
                target.target_id,
                10,
                vec![MutableDocument::new_found_document(key("rooms/a"), version(10), data(&[("size", 1)]))],
            ))
            .unwrap();

        backend.set_fail_commits(true);
        assert!(store
            .apply_remote_event(&remote_event(
                target.target_id,
                20,
                vec![MutableDocument::new_found_document(key("rooms/b"), version(20), data(&[("size", 2)]))],
            ))
            .is_err());
        assert!(!store.contains_remote_document(&key("rooms/b")));
        assert_eq!(store.get_last_remote_snapshot_version(), version(10));
        assert_eq!(
            store.get_remote_document_keys(target.target_id),
            BTreeSet::from([key("rooms/a")])
        );
        let active = store
            .get_target_data(&Query::collection("rooms").unwrap().to_target())
            .unwrap();
        assert_eq!(active.snapshot_version, version(10));
    }

    #[test]
    fn garbage_collection_spares_referenced_documents() {
        let mut store = store();
        let rooms = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        let users = store
            .allocate_target(Query::collection("users").unwrap().to_target())
            .unwrap();
        store
            .apply_remote_event(&remote_event(
                rooms.target_id,
                10,
                vec![MutableDocument::new_found_document(key("rooms/a"), version(10), data(&[("size", 1)]))],
            ))
            .unwrap();
        store
            .apply_remote_event(&remote_event(
                users.target_id,
                20,
                vec![
                    MutableDocument::new_found_document(key("users/u"), version(20), data(&[("age", 1)])),
                    MutableDocument::new_found_document(key("users/v"), version(20), data(&[("age", 2)])),
                ],
            ))
            .unwrap();
        store
            .local_write(vec![Mutation::delete(key("users/v"))], Timestamp::now())
            .unwrap();
        store.release_target(users.target_id, false).unwrap();

        let collector = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let results = store.collect_garbage(&collector).unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert!(store.contains_remote_document(&key("rooms/a")));
        assert!(store.contains_remote_document(&key("users/v")));
        assert!(!store.contains_remote_document(&key("users/u")));
    }
}
