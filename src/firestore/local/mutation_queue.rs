use std::collections::{BTreeSet, VecDeque};

use crate::firestore::constants::BATCH_ID_UNKNOWN;
use crate::firestore::core::query::Query;
use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::local::persistence::{PendingWrite, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp};

/// Ordered log of the pending writes of one user.
///
/// Batches are kept in id order; a sorted `(key, batch id)` index answers
/// "which batches touch this key or collection" with range scans.
#[derive(Debug)]
pub struct MutationQueue {
    queue: VecDeque<MutationBatch>,
    next_batch_id: i32,
    last_stream_token: Vec<u8>,
    batches_by_document_key: BTreeSet<(DocumentKey, i32)>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: BTreeSet::new(),
        }
    }

    /// Rebuilds the queue from stored batches and metadata.
    pub fn restore(mut batches: Vec<MutationBatch>, highest_batch_id: i32, last_stream_token: Vec<u8>) -> Self {
        batches.sort_by_key(|batch| batch.batch_id);
        let mut queue = Self::new();
        let highest_stored = batches.last().map_or(0, |batch| batch.batch_id);
        queue.next_batch_id = highest_batch_id.max(highest_stored) + 1;
        queue.last_stream_token = last_stream_token;
        for batch in batches {
            queue.index_batch(&batch);
            queue.queue.push_back(batch);
        }
        queue
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn add_mutation_batch(
        &mut self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), || "Mutation batches should not be empty".to_string())?;
        let batch_id = self.next_batch_id;
        if let Some(last) = self.queue.back() {
            hard_assert(last.batch_id < batch_id, || {
                "Mutation batch ids must be monotonically increasing".to_string()
            })?;
        }
        self.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        self.index_batch(&batch);
        self.queue.push_back(batch.clone());

        txn.record(PendingWrite::MutationBatch(batch.clone()));
        self.record_metadata(txn);
        log::debug!("added mutation batch {batch_id} ({} mutations)", batch.mutations.len());
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        let index = self.index_of_batch_id(batch_id)?;
        self.queue.get(index)
    }

    /// First batch with an id greater than `batch_id`, or the first batch when
    /// `batch_id` is [`BATCH_ID_UNKNOWN`].
    pub fn get_next_mutation_batch_after_batch_id(&self, batch_id: i32) -> Option<&MutationBatch> {
        let next = batch_id.max(BATCH_ID_UNKNOWN) + 1;
        let start = self.queue.partition_point(|batch| batch.batch_id < next);
        self.queue.get(start)
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.queue.back().map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id)
    }

    pub fn get_all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.iter().cloned().collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        let ids: BTreeSet<i32> = self.batch_ids_for_key(key).collect();
        self.batches_for_ids(ids)
    }

    pub fn get_all_mutation_batches_affecting_document_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> Vec<MutationBatch> {
        let ids: BTreeSet<i32> = keys.into_iter().flat_map(|key| self.batch_ids_for_key(key)).collect();
        self.batches_for_ids(ids)
    }

    /// Batches touching a document directly inside the query's collection.
    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        if query.is_document_query() {
            let key = DocumentKey::from_path_unchecked(query.path().clone());
            return self.get_all_mutation_batches_affecting_document_key(&key);
        }
        let mut ids = BTreeSet::new();
        if let Some(group) = query.collection_group_id() {
            for (key, id) in &self.batches_by_document_key {
                if key.has_collection_id(group) && query.path().is_prefix_of(key.path()) {
                    ids.insert(*id);
                }
            }
            return self.batches_for_ids(ids);
        }

        let prefix = query.path();
        let start = (DocumentKey::from_path_unchecked(prefix.clone()), i32::MIN);
        for (key, id) in self.batches_by_document_key.range(start..) {
            if !prefix.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() == prefix.len() + 1 {
                ids.insert(*id);
            }
        }
        self.batches_for_ids(ids)
    }

    /// Removes the oldest batch. Batches can only leave the queue in FIFO order.
    pub fn remove_mutation_batch(&mut self, txn: &mut PersistenceTransaction, batch: &MutationBatch) -> FirestoreResult<()> {
        hard_assert(
            self.queue.front().is_some_and(|first| first.batch_id == batch.batch_id),
            || "Can only remove the first entry of the mutation queue".to_string(),
        )?;
        self.queue.pop_front();
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .remove(&(mutation.key().clone(), batch.batch_id));
        }
        txn.record(PendingWrite::RemoveMutationBatch(batch.batch_id));
        Ok(())
    }

    pub fn acknowledge_batch(
        &mut self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let index = self.index_of_existing_batch_id(batch.batch_id, "acknowledged")?;
        hard_assert(index == 0, || "Can only acknowledge the first batch in the mutation queue".to_string())?;
        self.last_stream_token = stream_token;
        self.record_metadata(txn);
        Ok(())
    }

    pub fn get_last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, txn: &mut PersistenceTransaction, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
        self.record_metadata(txn);
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    /// An empty queue must not retain key references.
    pub fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.queue.is_empty() {
            hard_assert(self.batches_by_document_key.is_empty(), || {
                "Document leak -- detected dangling mutation references when queue is empty.".to_string()
            })?;
        }
        Ok(())
    }

    fn record_metadata(&self, txn: &mut PersistenceTransaction) {
        txn.record(PendingWrite::MutationQueueMetadata {
            last_stream_token: self.last_stream_token.clone(),
            highest_batch_id: self.next_batch_id - 1,
        });
    }

    fn index_batch(&mut self, batch: &MutationBatch) {
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .insert((mutation.key().clone(), batch.batch_id));
        }
    }

    fn batch_ids_for_key<'a>(&'a self, key: &'a DocumentKey) -> impl Iterator<Item = i32> + 'a {
        self.batches_by_document_key
            .range((key.clone(), i32::MIN)..)
            .take_while(move |(found, _)| found == key)
            .map(|(_, id)| *id)
    }

    fn batches_for_ids(&self, ids: BTreeSet<i32>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.lookup_mutation_batch(id).cloned())
            .collect()
    }

    fn index_of_batch_id(&self, batch_id: i32) -> Option<usize> {
        self.queue
            .binary_search_by_key(&batch_id, |batch| batch.batch_id)
            .ok()
    }

    fn index_of_existing_batch_id(&self, batch_id: i32, action: &str) -> FirestoreResult<usize> {
        let index = self.index_of_batch_id(batch_id);
        hard_assert(index.is_some(), || format!("Batches must exist to be {action}"))?;
        Ok(index.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn txn() -> PersistenceTransaction {
        PersistenceTransaction::new("test", 1)
    }

    fn add(queue: &mut MutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths
            .iter()
            .map(|path| Mutation::set(key(path), MapValue::empty()))
            .collect();
        queue
            .add_mutation_batch(&mut txn(), Timestamp::now(), Vec::new(), mutations)
            .unwrap()
    }

    #[test]
    fn assigns_increasing_batch_ids() {
        let mut queue = MutationQueue::new();
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        let first = add(&mut queue, &["rooms/a"]);
        let second = add(&mut queue, &["rooms/b"]);
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), 2);
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN).unwrap().batch_id, 1);
        assert_eq!(queue.get_next_mutation_batch_after_batch_id(1).unwrap().batch_id, 2);
        assert!(queue.get_next_mutation_batch_after_batch_id(2).is_none());
    }

    #[test]
    fn finds_batches_by_key_and_collection() {
        let mut queue = MutationQueue::new();
        add(&mut queue, &["rooms/a", "rooms/a/messages/m1"]);
        add(&mut queue, &["rooms/b"]);
        add(&mut queue, &["roomsx/c"]);

        let by_key = queue.get_all_mutation_batches_affecting_document_key(&key("rooms/a"));
        assert_eq!(by_key.len(), 1);

        let by_query = queue.get_all_mutation_batches_affecting_query(&Query::collection("rooms").unwrap());
        let ids: Vec<_> = by_query.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let group = Query::collection_group("messages").unwrap();
        assert_eq!(queue.get_all_mutation_batches_affecting_query(&group).len(), 1);
    }

    #[test]
    fn removal_is_fifo_only() {
        let mut queue = MutationQueue::new();
        let first = add(&mut queue, &["rooms/a"]);
        let second = add(&mut queue, &["rooms/b"]);

        let err = queue.remove_mutation_batch(&mut txn(), &second).unwrap_err();
        assert!(err.message().contains("Can only remove the first entry of the mutation queue"));

        let mut txn = txn();
        queue.remove_mutation_batch(&mut txn, &first).unwrap();
        assert!(txn.writes().contains(&PendingWrite::RemoveMutationBatch(1)));
        assert!(!queue.contains_key(&key("rooms/a")));
        assert!(queue.lookup_mutation_batch(2).is_some());

        queue.remove_mutation_batch(&mut PersistenceTransaction::new("t", 1), &second).unwrap();
        queue.perform_consistency_check().unwrap();
    }

    #[test]
    fn restore_continues_numbering() {
        let mut queue = MutationQueue::new();
        let batch = add(&mut queue, &["rooms/a"]);
        let restored = MutationQueue::restore(vec![batch], 4, b"token".to_vec());
        assert_eq!(restored.get_last_stream_token(), b"token");
        assert!(restored.contains_key(&key("rooms/a")));
        let mut restored = restored;
        assert_eq!(add(&mut restored, &["rooms/b"]).batch_id, 5);
    }
}
