use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{DocumentComparator, LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::local::local_store::DocumentMap;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::TargetChange;

/// A key entering or leaving limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Document changes computed against a view but not yet applied to it.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A document left a limited view, so the view must be recomputed from
    /// the local store to find the replacement.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side state of one query: the documents it shows and how they
/// relate to what the backend has confirmed.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// Whether the backend has marked this view current.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reports for this target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            comparator: query.comparator(),
            document_set: DocumentSet::for_query(&query),
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Computes how `doc_changes` would change this view without applying
    /// them. `previous` chains a second pass after a refill.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);
            let old_had_pending = old_doc.map_or(false, |doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.map_or(false, |doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !Self::should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()))?;
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| (self.comparator)(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| (self.comparator)(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                // The doc moved past the limit edge, so another
                                // doc may need to take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()))?;
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()))?;
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()))?;
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted))?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        })
    }

    /// A locally modified document that the backend just acknowledged keeps
    /// showing the local version until the synced version arrives.
    fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
        old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
    }

    /// Applies computed changes and the target change from the same remote
    /// event, returning a snapshot if anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
    ) -> FirestoreResult<ViewChange> {
        hard_assert(!doc_changes.needs_refill, || {
            "Cannot apply changes that need a refill".to_string()
        })?;
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        let comparator = self.comparator.clone();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change)?;
        let limbo_changes = if limbo_resolution_enabled {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return Ok(ViewChange {
                snapshot: None,
                limbo_changes,
            });
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: self.document_set.clone(),
            old_docs,
            doc_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        Ok(ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        })
    }

    /// Going offline makes a current view non-current so it reports
    /// from-cache results.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> FirestoreResult<ViewChange> {
        if !(self.current && online_state == OnlineState::Offline) {
            return Ok(ViewChange::default());
        }
        self.current = false;
        let unchanged = ViewDocumentChanges {
            document_set: self.document_set.clone(),
            change_set: DocumentChangeSet::new(),
            mutated_keys: self.mutated_keys.clone(),
            needs_refill: false,
        };
        self.apply_changes(unchanged, false, None)
    }

    /// Snapshot reporting every current document as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) -> FirestoreResult<()> {
        let Some(change) = target_change else {
            return Ok(());
        };
        self.synced_documents.extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            hard_assert(self.synced_documents.contains(key), || {
                format!("Modified document {key} not found in view")
            })?;
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
        Ok(())
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    /// Shown locally, not confirmed by the backend and not explained by a
    /// pending write.
    fn should_be_in_limbo(&self, doc: &MutableDocument) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, size: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), FirestoreValue::from_integer(size));
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(10), data)
    }

    fn docs(entries: &[MutableDocument]) -> DocumentMap {
        entries.iter().map(|doc| (doc.key().clone(), doc.clone())).collect()
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            resume_token: b"token".to_vec(),
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn apply(view: &mut View, entries: &[MutableDocument], target_change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&docs(entries), None).unwrap();
        view.apply_changes(changes, true, target_change).unwrap()
    }

    #[test]
    fn first_snapshot_is_local_until_current() {
        let mut view = View::new(Query::collection("rooms").unwrap(), BTreeSet::new());
        let change = apply(&mut view, &[doc("rooms/a", 1), doc("other/b", 2)], None);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert_eq!(snapshot.docs.len(), 1);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Added);

        let change = apply(&mut view, &[], Some(&current_change(&["rooms/a"])));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.doc_changes.is_empty());
        assert!(snapshot.has_cached_results);
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(Query::collection("rooms").unwrap(), BTreeSet::new());
        let change = apply(
            &mut view,
            &[doc("rooms/a", 1), doc("rooms/b", 2)],
            Some(&current_change(&["rooms/a"])),
        );
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.unwrap().from_cache);

        let removal = current_change(&[]);
        let deleted = MutableDocument::new_no_document(key("rooms/b"), SnapshotVersion::from_micros(20));
        let change = apply(&mut view, &[deleted], Some(&removal));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Removed);
    }

    #[test]
    fn limit_eviction_requests_refill() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("size").unwrap(), crate::firestore::core::query::Direction::Ascending)
            .limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)], None);
        assert_eq!(view.document_set.len(), 2);

        let removed = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(20));
        let changes = view.compute_doc_changes(&docs(&[removed]), None).unwrap();
        assert!(changes.needs_refill);

        let refilled = view
            .compute_doc_changes(&docs(&[doc("rooms/b", 2), doc("rooms/c", 3)]), Some(changes))
            .unwrap();
        assert!(!refilled.needs_refill);
        let keys: Vec<String> = refilled.document_set.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn going_offline_marks_current_view_from_cache() {
        let mut view = View::new(Query::collection("rooms").unwrap(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], Some(&current_change(&["rooms/a"])));
        let change = view.apply_online_state_change(OnlineState::Offline).unwrap();
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(view
            .apply_online_state_change(OnlineState::Offline)
            .unwrap()
            .snapshot
            .is_none());
    }
}
