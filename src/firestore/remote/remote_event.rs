use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Everything the watch stream reported up to one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose existence filter failed and must be re-listened with the
    /// given purpose.
    pub target_mismatches: BTreeMap<i32, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Keys only seen by limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta since the previous remote event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
