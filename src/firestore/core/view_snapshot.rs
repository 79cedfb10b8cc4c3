use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write or from-cache state changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: MutableDocument) -> Self {
        Self { change_type, doc }
    }
}

/// Accumulates per-document changes, collapsing successive changes to the
/// same key into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        use ChangeType::*;

        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };

        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.doc))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "Unsupported combination of changes: {new_type:?} after {old_type:?} for {key}"
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Whether a view is consistent with the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results come from the local cache only.
    Local,
    /// Results match a consistent backend snapshot.
    Synced,
}

/// Immutable result of a view at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document in `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        let old_docs = DocumentSet::for_query(&query);
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
