use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::local::persistence::{PendingWrite, PersistenceTransaction, TargetGlobals};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Metadata and matching document keys of every persisted target.
#[derive(Debug)]
pub struct TargetCache {
    targets: BTreeMap<i32, TargetData>,
    ids_by_canonical_id: HashMap<String, i32>,
    references: ReferenceSet,
    highest_target_id: i32,
    highest_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
    id_generator: TargetIdGenerator,
}

impl Default for TargetCache {
    fn default() -> Self {
        Self::restore(Vec::new(), Vec::new(), TargetGlobals::default())
    }
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(
        targets: Vec<TargetData>,
        matching_keys: Vec<(i32, BTreeSet<DocumentKey>)>,
        globals: TargetGlobals,
    ) -> Self {
        let highest_target_id = targets
            .iter()
            .map(|data| data.target_id)
            .fold(globals.highest_target_id, i32::max);
        let mut cache = Self {
            targets: BTreeMap::new(),
            ids_by_canonical_id: HashMap::new(),
            references: ReferenceSet::new(),
            highest_target_id,
            highest_sequence_number: globals.highest_listen_sequence_number,
            last_remote_snapshot_version: globals.last_remote_snapshot_version,
            id_generator: TargetIdGenerator::for_target_cache(highest_target_id),
        };
        for data in targets {
            cache.insert(data);
        }
        for (target_id, keys) in matching_keys {
            cache.references.add_references(keys, target_id);
        }
        cache
    }

    pub fn allocate_target_id(&mut self) -> i32 {
        let id = self.id_generator.next_id();
        self.highest_target_id = self.highest_target_id.max(id);
        id
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        let id = self.ids_by_canonical_id.get(&target.canonical_id())?;
        self.targets.get(id)
    }

    pub fn get_target_data_by_id(&self, target_id: i32) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn add_target_data(&mut self, txn: &mut PersistenceTransaction, data: TargetData) -> FirestoreResult<()> {
        hard_assert(!self.targets.contains_key(&data.target_id), || {
            format!("Cannot add a target that already exists: {}", data.target_id)
        })?;
        self.save(txn, data);
        Ok(())
    }

    pub fn update_target_data(&mut self, txn: &mut PersistenceTransaction, data: TargetData) -> FirestoreResult<()> {
        hard_assert(self.targets.contains_key(&data.target_id), || {
            format!("Cannot update a non-existent target: {}", data.target_id)
        })?;
        self.save(txn, data);
        Ok(())
    }

    /// Removes the target and its matching keys. Returns the removed keys.
    pub fn remove_target_data(&mut self, txn: &mut PersistenceTransaction, target_id: i32) -> BTreeSet<DocumentKey> {
        if let Some(data) = self.targets.remove(&target_id) {
            self.ids_by_canonical_id.remove(&data.target.canonical_id());
        }
        let keys = self.references.remove_references_for_id(target_id);
        txn.record(PendingWrite::RemoveTarget(target_id));
        self.record_globals(txn);
        keys
    }

    pub fn add_matching_keys(
        &mut self,
        txn: &mut PersistenceTransaction,
        keys: impl IntoIterator<Item = DocumentKey>,
        target_id: i32,
    ) {
        self.references.add_references(keys, target_id);
        self.record_keys(txn, target_id);
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        txn: &mut PersistenceTransaction,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: i32,
    ) {
        self.references.remove_references(keys, target_id);
        self.record_keys(txn, target_id);
    }

    pub fn remove_matching_keys_for_target_id(
        &mut self,
        txn: &mut PersistenceTransaction,
        target_id: i32,
    ) -> BTreeSet<DocumentKey> {
        let removed = self.references.remove_references_for_id(target_id);
        self.record_keys(txn, target_id);
        removed
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_target_snapshot_version(&mut self, txn: &mut PersistenceTransaction, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
        self.record_globals(txn);
    }

    pub fn highest_sequence_number(&self) -> i64 {
        self.highest_sequence_number
    }

    pub fn highest_target_id(&self) -> i32 {
        self.highest_target_id
    }

    pub fn get_target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    /// Removes every target with a sequence number at or below `upper_bound`
    /// that is not listed in `active_target_ids`. Returns the removed targets'
    /// former matching keys, by target.
    pub fn remove_targets(
        &mut self,
        txn: &mut PersistenceTransaction,
        upper_bound: i64,
        active_target_ids: &BTreeSet<i32>,
    ) -> Vec<(i32, BTreeSet<DocumentKey>)> {
        let doomed: Vec<i32> = self
            .targets
            .values()
            .filter(|data| data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id))
            .map(|data| data.target_id)
            .collect();
        doomed
            .into_iter()
            .map(|target_id| (target_id, self.remove_target_data(txn, target_id)))
            .collect()
    }

    fn save(&mut self, txn: &mut PersistenceTransaction, data: TargetData) {
        if data.target_id > self.highest_target_id {
            self.highest_target_id = data.target_id;
        }
        if data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = data.sequence_number;
        }
        txn.record(PendingWrite::Target(data.clone()));
        self.insert(data);
        self.record_globals(txn);
    }

    fn insert(&mut self, data: TargetData) {
        self.ids_by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        self.targets.insert(data.target_id, data);
    }

    fn record_keys(&self, txn: &mut PersistenceTransaction, target_id: i32) {
        txn.record(PendingWrite::TargetDocuments {
            target_id,
            keys: self.references.references_for_id(target_id),
        });
    }

    fn record_globals(&self, txn: &mut PersistenceTransaction) {
        txn.record(PendingWrite::TargetGlobals(TargetGlobals {
            highest_target_id: self.highest_target_id,
            highest_listen_sequence_number: self.highest_sequence_number,
            last_remote_snapshot_version: self.last_remote_snapshot_version,
            target_count: self.targets.len(),
        }));
    }
}
