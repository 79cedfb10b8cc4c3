use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::local::persistence::{PendingWrite, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};

/// Counts documents read while executing a query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    pub documents_read_count: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    document: MutableDocument,
    size: usize,
}

/// Last known server state of every cached document.
#[derive(Debug, Default)]
pub struct RemoteDocumentCache {
    docs: BTreeMap<DocumentKey, Entry>,
    size: usize,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(documents: impl IntoIterator<Item = MutableDocument>) -> Self {
        let mut cache = Self::new();
        for document in documents {
            cache.insert(document);
        }
        cache
    }

    /// Stores `doc` as read at `read_time`, replacing any previous entry.
    pub fn add_entry(
        &mut self,
        txn: &mut PersistenceTransaction,
        mut doc: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        hard_assert(!read_time.is_min(), || {
            "Cannot add a document with a read time of zero".to_string()
        })?;
        doc.set_read_time(read_time);
        txn.record(PendingWrite::RemoteDocument(doc.clone()));
        self.insert(doc);
        Ok(())
    }

    pub fn remove_entry(&mut self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        if let Some(entry) = self.docs.remove(key) {
            self.size -= entry.size;
            txn.record(PendingWrite::RemoveRemoteDocument(key.clone()));
        }
    }

    /// Cached document, or an invalid placeholder when the key is unknown.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.docs
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'a>(&self, keys: impl IntoIterator<Item = &'a DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.docs.contains_key(key)
    }

    /// Documents directly in the query's collection that sort after `offset` and
    /// either match the query or carry a pending mutation.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection = query.path();
        let start = DocumentKey::from_path_unchecked(collection.clone());
        let mut results = BTreeMap::new();
        for (key, entry) in self.docs.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            context.documents_read_count += 1;
            let doc = &entry.document;
            if IndexOffset::from_document(doc) <= *offset {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(doc) {
                continue;
            }
            results.insert(key.clone(), doc.clone());
        }
        results
    }

    /// Up to `limit` documents in `collection_group` after `offset`, in offset order.
    pub fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> Vec<MutableDocument> {
        let mut matching: Vec<&MutableDocument> = self
            .docs
            .values()
            .map(|entry| &entry.document)
            .filter(|doc| doc.key().has_collection_id(collection_group))
            .filter(|doc| IndexOffset::from_document(doc) > *offset)
            .collect();
        matching.sort_by_key(|doc| IndexOffset::from_document(doc));
        matching.into_iter().take(limit).cloned().collect()
    }

    /// Sum of the estimated sizes of all entries.
    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.docs.keys()
    }

    pub fn documents(&self) -> impl Iterator<Item = &MutableDocument> {
        self.docs.values().map(|entry| &entry.document)
    }

    fn insert(&mut self, document: MutableDocument) {
        let size = document.estimate_byte_size();
        let key = document.key().clone();
        if let Some(previous) = self.docs.insert(key, Entry { document, size }) {
            self.size -= previous.size;
        }
        self.size += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{FieldFilter, FilterOperator};
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, size: i64, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), FirestoreValue::from_integer(size));
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn add(cache: &mut RemoteDocumentCache, doc: MutableDocument, read_time: i64) {
        cache
            .add_entry(&mut PersistenceTransaction::new("test", 1), doc, SnapshotVersion::from_micros(read_time))
            .unwrap();
    }

    #[test]
    fn missing_entries_are_invalid() {
        let cache = RemoteDocumentCache::new();
        assert!(!cache.get_entry(&key("rooms/a")).is_valid_document());
    }

    #[test]
    fn rejects_zero_read_time() {
        let mut cache = RemoteDocumentCache::new();
        let err = cache
            .add_entry(&mut PersistenceTransaction::new("test", 1), doc("rooms/a", 1, 1), SnapshotVersion::min())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn tracks_size() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, doc("rooms/a", 1, 1), 1);
        let single = cache.get_size();
        assert!(single > 0);
        add(&mut cache, doc("rooms/a", 2, 2), 2);
        assert_eq!(cache.get_size(), single);
        cache.remove_entry(&mut PersistenceTransaction::new("test", 1), &key("rooms/a"));
        assert_eq!(cache.get_size(), 0);
    }

    #[test]
    fn query_scan_respects_offset_and_pending_keys() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, doc("rooms/a", 1, 1), 10);
        add(&mut cache, doc("rooms/b", 5, 1), 20);
        add(&mut cache, doc("rooms/c", 1, 1), 30);
        add(&mut cache, doc("rooms/c/messages/m", 9, 1), 30);

        let query = Query::collection("rooms").unwrap().with_filter(FieldFilter::new(
            FieldPath::from_dot_separated("size").unwrap(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(3),
        ));
        let mut context = QueryContext::default();
        let mutated: BTreeSet<_> = [key("rooms/c")].into_iter().collect();
        let results = cache.get_documents_matching_query(&query, &IndexOffset::min(), &mutated, &mut context);
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b"), key("rooms/c")]);
        assert_eq!(context.documents_read_count, 3);

        let offset = IndexOffset::successor_of_read_time(SnapshotVersion::from_micros(20), -1);
        let results = cache.get_documents_matching_query(&query, &offset, &mutated, &mut QueryContext::default());
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/c")]);
    }
}
