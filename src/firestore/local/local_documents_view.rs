use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::{QueryContext, RemoteDocumentCache};
use crate::firestore::model::mutation::calculate_overlay_mutation;
use crate::firestore::model::{
    DocumentKey, FieldMask, IndexOffset, MutableDocument, MutationKind, OverlayedDocument, Overlay, Timestamp,
};

/// Local view of documents: remote state with pending overlays applied.
///
/// Borrows the caches it reads from the local store for the duration of one
/// operation.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    mutation_queue: &'a MutationQueue,
    overlays: &'a mut DocumentOverlayCache,
    index_manager: &'a IndexManager,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(
        remote_documents: &'a RemoteDocumentCache,
        mutation_queue: &'a MutationQueue,
        overlays: &'a mut DocumentOverlayCache,
        index_manager: &'a IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    /// Current local state of `key`; invalid when nothing is known about it.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let overlay = self.overlays.get_overlay(key);
        let mut document = self.base_document(key, overlay);
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    /// Local state of every key, read without touching stored overlays.
    pub fn get_documents<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut docs = self.remote_documents.get_entries(keys);
        for (key, doc) in docs.iter_mut() {
            if let Some(overlay) = self.overlays.get_overlay(key) {
                let mask = overlay.mutation.field_mask().cloned();
                overlay.mutation.apply_to_local_view(doc, mask, Timestamp::now());
            }
        }
        docs
    }

    /// Applies overlays onto `docs`. Keys in `existence_state_changed` whose
    /// overlay is missing or a patch get their overlays recomputed from the
    /// mutation queue.
    pub fn get_local_view_of_documents(
        &mut self,
        txn: &mut PersistenceTransaction,
        docs: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays = self.overlays.get_overlays(docs.keys());
        self.compute_views(txn, docs, &overlays, existence_state_changed)
    }

    fn compute_views(
        &mut self,
        txn: &mut PersistenceTransaction,
        mut docs: BTreeMap<DocumentKey, MutableDocument>,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let mut recalculate = BTreeMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, doc) in docs.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay.is_some_and(|o| matches!(o.mutation.kind(), MutationKind::Patch { .. }));
            if existence_state_changed.contains(key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key.clone(), doc.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask().cloned();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay.mutation.apply_to_local_view(doc, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated_masks = self.recalculate_and_save_overlays(txn, &mut recalculate);
        mutated_fields.extend(recalculated_masks);
        docs.extend(recalculate);

        docs.into_iter()
            .map(|(key, document)| {
                let mutated = mutated_fields.remove(&key).flatten();
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields: mutated,
                    },
                )
            })
            .collect()
    }

    /// Folds every batch touching `docs` onto them in batch-id order and stores
    /// one overlay per key, tagged with the highest batch that touches it.
    /// Returns the mutated-field mask per key (`None` for whole-document writes).
    pub fn recalculate_and_save_overlays(
        &mut self,
        txn: &mut PersistenceTransaction,
        docs: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<i32, BTreeSet<DocumentKey>> = BTreeMap::new();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(docs.keys());

        for batch in &batches {
            for key in batch.keys() {
                let Some(base) = docs.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(base, previous);
                masks.insert(key.clone(), mask);
                documents_by_batch_id.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(doc), Some(mask)) = (docs.get(&key), masks.get(&key)) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(doc, mask.as_ref()) {
                    overlays.insert(key, mutation);
                }
            }
            self.overlays.save_overlays(txn, batch_id, &overlays);
        }
        masks
    }

    /// Recomputes overlays for `keys` from the remote cache.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &mut self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) {
        let mut docs = self.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(txn, &mut docs);
    }

    /// Documents matching `query` that sort after `offset`, with overlays applied.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            let key = DocumentKey::from_path_unchecked(query.path().clone());
            let document = self.get_document(&key);
            let mut results = BTreeMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return results;
        }
        if let Some(group) = query.collection_group_id() {
            let mut results = BTreeMap::new();
            for parent in self.index_manager.get_collection_parents(group) {
                let collection = parent.child(group);
                if !query.path().is_prefix_of(&collection) {
                    continue;
                }
                let collection_query = query.as_collection_query_at_path(collection);
                results.extend(self.get_documents_matching_collection_query(&collection_query, offset, context));
            }
            return results;
        }
        self.get_documents_matching_collection_query(query, offset, context)
    }

    /// Keys with a pending overlay that could belong to `query`'s results.
    pub fn overlay_keys_for_query(&self, query: &Query) -> BTreeSet<DocumentKey> {
        match query.collection_group_id() {
            Some(group) => self
                .overlays
                .get_overlays_for_collection_group(group, -1, usize::MAX)
                .into_keys()
                .filter(|key| query.path().is_prefix_of(key.path()))
                .collect(),
            None => self
                .overlays
                .get_overlays_for_collection(query.path(), -1)
                .into_keys()
                .collect(),
        }
    }

    fn get_documents_matching_collection_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self
            .overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id);
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut remote = self
            .remote_documents
            .get_documents_matching_query(query, offset, &mutated_keys, context);

        // A document may only match because of its overlay.
        for key in overlays.keys() {
            remote
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }

    fn base_document(&self, key: &DocumentKey, overlay: Option<&Overlay>) -> MutableDocument {
        match overlay {
            Some(overlay) if !matches!(overlay.mutation.kind(), MutationKind::Patch { .. }) => {
                MutableDocument::new_invalid_document(key.clone())
            }
            _ => self.remote_documents.get_entry(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, Mutation, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(entries: &[(&str, i64)]) -> MapValue {
        let mut map = MapValue::empty();
        for (name, value) in entries {
            map.set(&FieldPath::from_dot_separated(name).unwrap(), FirestoreValue::from_integer(*value));
        }
        map
    }

    struct Fixture {
        remote: RemoteDocumentCache,
        queue: MutationQueue,
        overlays: DocumentOverlayCache,
        index: IndexManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                remote: RemoteDocumentCache::new(),
                queue: MutationQueue::new(),
                overlays: DocumentOverlayCache::new(),
                index: IndexManager::new(),
            }
        }

        fn view(&mut self) -> LocalDocumentsView<'_> {
            LocalDocumentsView::new(&self.remote, &self.queue, &mut self.overlays, &self.index)
        }

        fn write(&mut self, mutation: Mutation) {
            let mut txn = PersistenceTransaction::new("test", 1);
            let batch = self
                .queue
                .add_mutation_batch(&mut txn, Timestamp::now(), Vec::new(), vec![mutation])
                .unwrap();
            let mut docs = BTreeMap::new();
            for key in batch.keys() {
                docs.insert(key.clone(), self.remote.get_entry(&key));
            }
            self.view().recalculate_and_save_overlays(&mut txn, &mut docs);
        }
    }

    #[test]
    fn overlay_folds_batches_in_order() {
        let mut fixture = Fixture::new();
        let mut txn = PersistenceTransaction::new("test", 1);
        fixture
            .remote
            .add_entry(
                &mut txn,
                MutableDocument::new_found_document(key("rooms/a"), SnapshotVersion::from_micros(1), data(&[("a", 1), ("b", 1)])),
                SnapshotVersion::from_micros(1),
            )
            .unwrap();

        fixture.write(Mutation::patch(key("rooms/a"), data(&[("a", 2)]), data(&[("a", 2)]).field_mask()));
        fixture.write(Mutation::patch(key("rooms/a"), data(&[("c", 3)]), data(&[("c", 3)]).field_mask()));

        let overlay = fixture.overlays.get_overlay(&key("rooms/a")).unwrap().clone();
        assert_eq!(overlay.largest_batch_id, 2);
        let doc = fixture.view().get_document(&key("rooms/a"));
        assert_eq!(doc.data(), &data(&[("a", 2), ("b", 1), ("c", 3)]));
        assert!(doc.has_local_mutations());

        // Recomputing from scratch yields the same overlay.
        let keys: BTreeSet<_> = [key("rooms/a")].into_iter().collect();
        fixture
            .view()
            .recalculate_and_save_overlays_for_document_keys(&mut PersistenceTransaction::new("t", 1), &keys);
        assert_eq!(fixture.overlays.get_overlay(&key("rooms/a")), Some(&overlay));
    }

    #[test]
    fn set_overlay_ignores_remote_state() {
        let mut fixture = Fixture::new();
        fixture.write(Mutation::set(key("rooms/b"), data(&[("x", 1)])));
        let doc = fixture.view().get_document(&key("rooms/b"));
        assert!(doc.is_found_document());
        assert_eq!(doc.data(), &data(&[("x", 1)]));
    }

    #[test]
    fn query_includes_documents_matching_only_through_overlays() {
        let mut fixture = Fixture::new();
        fixture.write(Mutation::set(key("rooms/new"), data(&[("x", 1)])));
        fixture.write(Mutation::set(key("other/new"), data(&[("x", 1)])));
        let query = Query::collection("rooms").unwrap();
        let results = fixture
            .view()
            .get_documents_matching_query(&query, &IndexOffset::min(), &mut QueryContext::default());
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/new")]);
        assert_eq!(fixture.view().overlay_keys_for_query(&query).len(), 1);
    }
}
