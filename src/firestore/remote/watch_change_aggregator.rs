use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Target data of a target being listened to, if it is still active.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Result of checking an existence filter's Bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    Success,
    Skipped,
    FalsePositive,
}

/// Buffered watch state of one target between consistent snapshots.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests; changes are ignored while non-zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A fresh target always reports its first change.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let set = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            set.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) -> FirestoreResult<()> {
        self.pending_responses -= 1;
        hard_assert(self.pending_responses >= 0, || {
            "Ack for a target that was not pending".to_string()
        })
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates listen-stream changes into [`RemoteEvent`]s.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document was seen in.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange, provider: &dyn TargetMetadataProvider) {
        for &target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc) if doc.is_found_document() => self.add_document_to_target(target_id, doc.clone(), provider),
                _ => self.remove_document_from_target(target_id, change.key.clone(), change.new_doc.clone(), provider),
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(target_id, change.key.clone(), change.new_doc.clone(), provider);
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        for target_id in self.affected_targets(change, provider) {
            let is_active = self.is_active_target(target_id, provider);
            match change.state {
                TargetChangeState::NoChange => {
                    if is_active {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response()?;
                    if !state.is_pending() {
                        // A re-added target starts from a clean slate.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response()?;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(change.cause.is_none(), || {
                        "WatchChangeAggregator does not handle errored targets".to_string()
                    })?;
                }
                TargetChangeState::Current => {
                    if is_active {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if is_active {
                        // Everything sent since the last current is discarded.
                        self.reset_target(target_id, provider)?;
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
        Ok(())
    }

    /// Compares the backend's document count for a target with the local
    /// one, and resets the target when they disagree.
    pub fn handle_existence_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        provider: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
            return Ok(());
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted without the stream saying so.
                let key = DocumentKey::from_path_unchecked(target_data.target.path.clone());
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, key, Some(deleted), provider);
            } else {
                hard_assert(expected_count == 1, || {
                    format!("Single document existence filter with count: {expected_count}")
                })?;
            }
            return Ok(());
        }

        let current_count = self.current_document_count_for_target(target_id, provider);
        if current_count as i64 == i64::from(expected_count) {
            return Ok(());
        }
        let status = self.apply_bloom_filter(filter, current_count, provider);
        log::debug!(
            "existence filter mismatch for target {target_id}: expected {expected_count}, \
             have {current_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(target_id, provider)?;
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
        Ok(())
    }

    /// Drains every buffered change into a [`RemoteEvent`] at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target that never saw its document learns
                // that the document does not exist.
                let key = DocumentKey::from_path_unchecked(target_data.target.path.clone());
                let seen = self
                    .pending_document_target_mapping
                    .get(&key)
                    .is_some_and(|targets| targets.contains(&target_id))
                    && self.pending_document_updates.contains_key(&key);
                if !seen && !self.target_contains_document(target_id, &key, provider) {
                    let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                    self.remove_document_from_target(target_id, key, Some(deleted), provider);
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|&target_id| {
                self.target_data_for_active_target(target_id, provider)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for doc in document_updates.values_mut() {
            doc.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Notes that an add or remove request was sent for `target_id`; its
    /// changes are ignored until the backend acknowledges it.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn affected_targets(&self, change: &WatchTargetChange, provider: &dyn TargetMetadataProvider) -> Vec<i32> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|&target_id| self.is_active_target(target_id, provider))
            .collect()
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        current_count: usize,
        provider: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplicationStatus {
        let Some(names) = &filter.unchanged_names else {
            return BloomFilterApplicationStatus::Skipped;
        };
        let bitmap = match BASE64_STANDARD.decode(&names.bitmap) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::warn!("decoding the base64 bloom filter in existence filter failed: {err}");
                return BloomFilterApplicationStatus::Skipped;
            }
        };
        let bloom_filter = match BloomFilter::new(bitmap, names.padding, names.hash_count) {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}");
                return BloomFilterApplicationStatus::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplicationStatus::Skipped;
        }
        let removed = self.filter_removed_documents(&bloom_filter, filter.target_id, provider);
        if i64::from(filter.count) != current_count as i64 - removed as i64 {
            BloomFilterApplicationStatus::FalsePositive
        } else {
            BloomFilterApplicationStatus::Success
        }
    }

    /// Removes cached keys the filter proves absent. Returns how many.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: i32,
        provider: &dyn TargetMetadataProvider,
    ) -> usize {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = format!("{}/documents/{}", self.database_id, key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None, provider);
                removed += 1;
            }
        }
        removed
    }

    fn add_document_to_target(&mut self, target_id: i32, doc: MutableDocument, provider: &dyn TargetMetadataProvider) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = doc.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, provider) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, doc);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The target never reported the document; forget any pending add.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_document {
            self.pending_document_updates.insert(key, doc);
        }
    }

    fn reset_target(&mut self, target_id: i32, provider: &dyn TargetMetadataProvider) -> FirestoreResult<()> {
        hard_assert(
            !self.target_states.get(&target_id).is_some_and(TargetState::is_pending),
            || "Should only reset active targets".to_string(),
        )?;
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, provider);
        }
        Ok(())
    }

    fn current_document_count_for_target(&mut self, target_id: i32, provider: &dyn TargetMetadataProvider) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = provider.get_remote_keys_for_target(target_id).len();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: i32, provider: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, provider).is_some()
    }

    fn target_data_for_active_target(&self, target_id: i32, provider: &dyn TargetMetadataProvider) -> Option<TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            return None;
        }
        provider.get_target_data_for_target(target_id)
    }

    fn target_contains_document(&self, target_id: i32, key: &DocumentKey, provider: &dyn TargetMetadataProvider) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::FieldPath;
    use crate::firestore::remote::watch_change::UnchangedNames;
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct Metadata {
        targets: BTreeMap<i32, TargetData>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    }

    impl TargetMetadataProvider for Metadata {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("v").unwrap(), FirestoreValue::from_integer(version));
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn metadata_with_rooms(keys: &[&str]) -> Metadata {
        let mut metadata = Metadata::default();
        let target = Query::collection("rooms").unwrap().to_target();
        metadata
            .targets
            .insert(2, TargetData::new(target, 2, TargetPurpose::Listen, 1));
        metadata
            .remote_keys
            .insert(2, keys.iter().map(|path| key(path)).collect());
        metadata
    }

    fn change(updated: Vec<i32>, doc: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: Vec::new(),
            key: doc.key().clone(),
            new_doc: Some(doc),
        }
    }

    #[test]
    fn accumulates_added_and_modified_documents() {
        let metadata = metadata_with_rooms(&["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator.handle_document_change(change(vec![2], doc("rooms/a", 5)), &metadata);
        aggregator.handle_document_change(change(vec![2], doc("rooms/b", 5)), &metadata);
        aggregator
            .handle_target_change(
                &WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(b"t1".to_vec()),
                &metadata,
            )
            .unwrap();

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        let target_change = &event.target_changes[&2];
        assert!(target_change.current);
        assert_eq!(target_change.resume_token, b"t1".to_vec());
        assert_eq!(target_change.added_documents, [key("rooms/b")].into_iter().collect());
        assert_eq!(target_change.modified_documents, [key("rooms/a")].into_iter().collect());
        assert_eq!(
            event.document_updates[&key("rooms/b")].read_time(),
            SnapshotVersion::from_micros(5)
        );
        assert!(event.resolved_limbo_documents.is_empty());

        let next = aggregator.create_remote_event(SnapshotVersion::from_micros(6), &metadata);
        assert!(next.target_changes.is_empty());
    }

    #[test]
    fn ignores_changes_for_pending_targets() {
        let metadata = metadata_with_rooms(&[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(change(vec![2], doc("rooms/a", 5)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert!(event.document_updates.is_empty());

        aggregator
            .handle_target_change(&WatchTargetChange::new(TargetChangeState::Added, vec![2]), &metadata)
            .unwrap();
        aggregator.handle_document_change(change(vec![2], doc("rooms/a", 6)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(6), &metadata);
        assert!(event.document_updates.contains_key(&key("rooms/a")));
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_filter_resets_target() {
        let metadata = metadata_with_rooms(&["rooms/a", "rooms/b", "rooms/c", "rooms/d"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator
            .handle_existence_filter(
                &ExistenceFilterChange {
                    target_id: 2,
                    count: 5,
                    unchanged_names: None,
                },
                &metadata,
            )
            .unwrap();
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(9), &metadata);
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 4);
        assert!(!event.target_changes[&2].current);
    }

    #[test]
    fn bloom_filter_removes_missing_documents() {
        let metadata = metadata_with_rooms(&["rooms/a", "rooms/b", "rooms/c"]);
        let names: Vec<String> = ["rooms/a", "rooms/b"]
            .iter()
            .map(|path| format!("projects/p/databases/(default)/documents/{path}"))
            .collect();
        let bloom = BloomFilter::create(1_000, 7, names.iter().map(String::as_str)).unwrap();
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator
            .handle_existence_filter(
                &ExistenceFilterChange {
                    target_id: 2,
                    count: 2,
                    unchanged_names: Some(UnchangedNames {
                        bitmap: BASE64_STANDARD.encode(bloom.bitmap()),
                        padding: bloom.padding(),
                        hash_count: bloom.hash_count() as i32,
                    }),
                },
                &metadata,
            )
            .unwrap();
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(9), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            [key("rooms/c")].into_iter().collect()
        );
    }

    #[test]
    fn malformed_bloom_filter_falls_back_to_full_requery() {
        let metadata = metadata_with_rooms(&["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator
            .handle_existence_filter(
                &ExistenceFilterChange {
                    target_id: 2,
                    count: 1,
                    unchanged_names: Some(UnchangedNames {
                        bitmap: "not base64!".to_string(),
                        padding: 0,
                        hash_count: 1,
                    }),
                },
                &metadata,
            )
            .unwrap();
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(9), &metadata);
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let mut metadata = Metadata::default();
        let target = Query::for_document(&key("rooms/a")).to_target();
        metadata
            .targets
            .insert(1, TargetData::new(target, 1, TargetPurpose::LimboResolution, 1));
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::new("p", "(default)"));
        aggregator
            .handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![1]), &metadata)
            .unwrap();
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(7), &metadata);
        let deleted = &event.document_updates[&key("rooms/a")];
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), SnapshotVersion::from_micros(7));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }
}
