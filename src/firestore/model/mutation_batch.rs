use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{hard_assert, FirestoreResult};
use crate::firestore::model::mutation::calculate_overlay_mutation;
use crate::firestore::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// A document in the local view together with the fields changed by pending
/// mutations (`None` when the whole document was replaced).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// Mutations written together by one local write.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Pinned values for non-idempotent transforms, applied before `mutations`.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies every mutation for `doc` using the server's per-mutation results.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        hard_assert(batch_result.mutation_results.len() == self.mutations.len(), || {
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                batch_result.mutation_results.len()
            )
        })?;
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, result)?;
            }
        }
        Ok(())
    }

    /// Applies the batch optimistically, returning the accumulated mutated fields.
    pub fn apply_to_local_view(&self, doc: &mut MutableDocument, mut mask: Option<FieldMask>) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to every document it touches and returns the overlay
    /// mutation for each key. Keys in `documents_without_remote_version` get a
    /// full-document overlay.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mutated = self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            let mutated = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mutated
            };
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated;
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// Server acknowledgement of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document has after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        hard_assert(batch.mutations.len() == mutation_results.len(), || {
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )
        })?;
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
