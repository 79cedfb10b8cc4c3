use std::collections::BTreeSet;

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::Target;
use crate::firestore::error::{data_loss, FirestoreError, FirestoreResult};
use crate::firestore::local::persistence::{
    PendingWrite, TargetGlobals, WriteBatch, DOCUMENT_OVERLAYS_PREFIX, MUTATIONS_PREFIX,
    MUTATION_QUEUE_KEY, REMOTE_DOCUMENTS_PREFIX, TARGETS_PREFIX, TARGET_DOCUMENTS_PREFIX,
    TARGET_GLOBALS_KEY,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, MutationBatch, Overlay};
use crate::firestore::remote::serializer::{decode_bytes, encode_bytes, JsonProtoSerializer};
use crate::firestore::remote::structured_query::{decode_target, encode_documents_target, encode_query_target};

/// Stored mutation queue bookkeeping for one user.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationQueueMetadata {
    pub last_stream_token: Vec<u8>,
    pub highest_batch_id: i32,
}

/// Converts local model objects to and from their stored JSON form.
///
/// Values reuse the wire encoding, so pending server timestamps keep their
/// reserved map shape on disk.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> FirestoreError {
    data_loss(format!("Failed to decode stored {what}: {err}"))
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn encode_remote_document(&self, doc: &MutableDocument) -> JsonValue {
        let kind = if doc.is_found_document() {
            "found"
        } else if doc.is_no_document() {
            "deleted"
        } else {
            "unknown"
        };
        let mut entry = json!({
            "path": doc.key().to_string(),
            "kind": kind,
            "version": self.remote.encode_version(&doc.version()),
            "readTime": self.remote.encode_version(&doc.read_time()),
            "hasCommittedMutations": doc.has_committed_mutations(),
        });
        if doc.is_found_document() {
            entry["fields"] = self.remote.encode_document_fields(doc.data());
        }
        entry
    }

    pub fn decode_remote_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let path = value
            .get("path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| corrupt("document", "missing path"))?;
        let key = DocumentKey::from_string(path).map_err(|err| corrupt("document", err))?;
        let version = self.remote.decode_version(value.get("version"))?;
        let read_time = self.remote.decode_version(value.get("readTime"))?;
        let mut doc = match value.get("kind").and_then(JsonValue::as_str) {
            Some("found") => {
                let fields = value.get("fields").cloned().unwrap_or_else(|| json!({}));
                let data = self.remote.decode_map_value(&json!({ "fields": fields }))?;
                MutableDocument::new_found_document(key, version, data)
            }
            Some("deleted") => MutableDocument::new_no_document(key, version),
            Some("unknown") => MutableDocument::new_unknown_document(key, version),
            other => return Err(corrupt("document", format!("unknown kind {other:?}"))),
        };
        if value
            .get("hasCommittedMutations")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
        {
            doc.set_has_committed_mutations();
        }
        doc.set_read_time(read_time);
        Ok(doc)
    }

    pub fn encode_mutation_batch(&self, batch: &MutationBatch) -> JsonValue {
        json!({
            "batchId": batch.batch_id,
            "localWriteTime": self.remote.encode_timestamp(&batch.local_write_time),
            "baseMutations": batch.base_mutations.iter().map(|m| self.remote.encode_mutation(m)).collect::<Vec<_>>(),
            "mutations": batch.mutations.iter().map(|m| self.remote.encode_mutation(m)).collect::<Vec<_>>(),
        })
    }

    pub fn decode_mutation_batch(&self, value: &JsonValue) -> FirestoreResult<MutationBatch> {
        let batch_id = value
            .get("batchId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| corrupt("mutation batch", "missing batchId"))? as i32;
        let local_write_time = match value.get("localWriteTime").and_then(JsonValue::as_str) {
            Some(text) => self.remote.decode_timestamp_string(text)?,
            None => return Err(corrupt("mutation batch", "missing localWriteTime")),
        };
        let decode_list = |field: &str| -> FirestoreResult<Vec<_>> {
            value
                .get(field)
                .and_then(JsonValue::as_array)
                .map(|items| items.iter().map(|item| self.remote.decode_mutation(item)).collect())
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        Ok(MutationBatch::new(
            batch_id,
            local_write_time,
            decode_list("baseMutations")?,
            decode_list("mutations")?,
        ))
    }

    pub fn encode_overlay(&self, overlay: &Overlay) -> JsonValue {
        json!({
            "largestBatchId": overlay.largest_batch_id,
            "mutation": self.remote.encode_mutation(&overlay.mutation),
        })
    }

    pub fn decode_overlay(&self, value: &JsonValue) -> FirestoreResult<Overlay> {
        let largest_batch_id = value
            .get("largestBatchId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| corrupt("overlay", "missing largestBatchId"))? as i32;
        let mutation = value
            .get("mutation")
            .ok_or_else(|| corrupt("overlay", "missing mutation"))?;
        Ok(Overlay::new(largest_batch_id, self.remote.decode_mutation(mutation)?))
    }

    pub fn encode_target_data(&self, data: &TargetData) -> JsonValue {
        let target = if data.target.is_document_target() {
            json!({ "documents": encode_documents_target(&self.remote, &data.target) })
        } else {
            json!({ "query": encode_query_target(&self.remote, &data.target) })
        };
        json!({
            "targetId": data.target_id,
            "canonicalId": data.target.canonical_id(),
            "purpose": purpose_name(data.purpose),
            "sequenceNumber": data.sequence_number,
            "snapshotVersion": self.remote.encode_version(&data.snapshot_version),
            "lastLimboFreeSnapshotVersion": self.remote.encode_version(&data.last_limbo_free_snapshot_version),
            "resumeToken": encode_bytes(&data.resume_token),
            "target": target,
        })
    }

    pub fn decode_target_data(&self, value: &JsonValue) -> FirestoreResult<TargetData> {
        let target_id = value
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| corrupt("target", "missing targetId"))? as i32;
        let target: Target = decode_target(
            &self.remote,
            value.get("target").ok_or_else(|| corrupt("target", "missing target"))?,
        )?;
        let purpose = parse_purpose(value.get("purpose").and_then(JsonValue::as_str));
        let sequence_number = value.get("sequenceNumber").and_then(JsonValue::as_i64).unwrap_or(0);
        let mut data = TargetData::new(target, target_id, purpose, sequence_number);
        data.snapshot_version = self.remote.decode_version(value.get("snapshotVersion"))?;
        data.last_limbo_free_snapshot_version =
            self.remote.decode_version(value.get("lastLimboFreeSnapshotVersion"))?;
        data.resume_token = decode_bytes(value.get("resumeToken"))?;
        Ok(data)
    }

    pub fn encode_target_keys(&self, keys: &BTreeSet<DocumentKey>) -> JsonValue {
        JsonValue::Array(keys.iter().map(|key| JsonValue::String(key.to_string())).collect())
    }

    pub fn decode_target_keys(&self, value: &JsonValue) -> FirestoreResult<BTreeSet<DocumentKey>> {
        value
            .as_array()
            .ok_or_else(|| corrupt("target documents", "expected an array"))?
            .iter()
            .map(|path| {
                let path = path
                    .as_str()
                    .ok_or_else(|| corrupt("target documents", "expected a path"))?;
                DocumentKey::from_string(path).map_err(|err| corrupt("target documents", err))
            })
            .collect()
    }

    pub fn encode_target_globals(&self, globals: &TargetGlobals) -> JsonValue {
        json!({
            "highestTargetId": globals.highest_target_id,
            "highestListenSequenceNumber": globals.highest_listen_sequence_number,
            "lastRemoteSnapshotVersion": self.remote.encode_version(&globals.last_remote_snapshot_version),
            "targetCount": globals.target_count,
        })
    }

    pub fn decode_target_globals(&self, value: &JsonValue) -> FirestoreResult<TargetGlobals> {
        Ok(TargetGlobals {
            highest_target_id: value.get("highestTargetId").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
            highest_listen_sequence_number: value
                .get("highestListenSequenceNumber")
                .and_then(JsonValue::as_i64)
                .unwrap_or(0),
            last_remote_snapshot_version: self.remote.decode_version(value.get("lastRemoteSnapshotVersion"))?,
            target_count: value.get("targetCount").and_then(JsonValue::as_u64).unwrap_or(0) as usize,
        })
    }

    pub fn encode_queue_metadata(&self, metadata: &MutationQueueMetadata) -> JsonValue {
        json!({
            "lastStreamToken": encode_bytes(&metadata.last_stream_token),
            "highestBatchId": metadata.highest_batch_id,
        })
    }

    pub fn decode_queue_metadata(&self, value: &JsonValue) -> FirestoreResult<MutationQueueMetadata> {
        Ok(MutationQueueMetadata {
            last_stream_token: decode_bytes(value.get("lastStreamToken"))?,
            highest_batch_id: value.get("highestBatchId").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
        })
    }

    /// Translates pending writes into backend operations. Shared state goes to
    /// `shared_namespace`, per-user state to `user_namespace`.
    pub fn encode_pending_writes(
        &self,
        writes: &[PendingWrite],
        shared_namespace: &str,
        user_namespace: &str,
    ) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for write in writes {
            match write {
                PendingWrite::RemoteDocument(doc) => batch.put(
                    shared_namespace,
                    remote_document_key(doc.key()),
                    self.encode_remote_document(doc),
                ),
                PendingWrite::RemoveRemoteDocument(key) => {
                    batch.delete(shared_namespace, remote_document_key(key))
                }
                PendingWrite::MutationBatch(mutation_batch) => batch.put(
                    user_namespace,
                    mutation_batch_key(mutation_batch.batch_id),
                    self.encode_mutation_batch(mutation_batch),
                ),
                PendingWrite::RemoveMutationBatch(batch_id) => {
                    batch.delete(user_namespace, mutation_batch_key(*batch_id))
                }
                PendingWrite::MutationQueueMetadata {
                    last_stream_token,
                    highest_batch_id,
                } => batch.put(
                    user_namespace,
                    MUTATION_QUEUE_KEY,
                    self.encode_queue_metadata(&MutationQueueMetadata {
                        last_stream_token: last_stream_token.clone(),
                        highest_batch_id: *highest_batch_id,
                    }),
                ),
                PendingWrite::Overlay(overlay) => batch.put(
                    user_namespace,
                    overlay_key(overlay.key()),
                    self.encode_overlay(overlay),
                ),
                PendingWrite::RemoveOverlay(key) => batch.delete(user_namespace, overlay_key(key)),
                PendingWrite::Target(data) => batch.put(
                    shared_namespace,
                    target_key(data.target_id),
                    self.encode_target_data(data),
                ),
                PendingWrite::RemoveTarget(target_id) => {
                    batch.delete(shared_namespace, target_key(*target_id));
                    batch.delete(shared_namespace, target_documents_key(*target_id));
                }
                PendingWrite::TargetDocuments { target_id, keys } => {
                    if keys.is_empty() {
                        batch.delete(shared_namespace, target_documents_key(*target_id));
                    } else {
                        batch.put(
                            shared_namespace,
                            target_documents_key(*target_id),
                            self.encode_target_keys(keys),
                        );
                    }
                }
                PendingWrite::TargetGlobals(globals) => batch.put(
                    shared_namespace,
                    TARGET_GLOBALS_KEY,
                    self.encode_target_globals(globals),
                ),
            }
        }
        batch
    }
}

pub fn remote_document_key(key: &DocumentKey) -> String {
    format!("{REMOTE_DOCUMENTS_PREFIX}{key}")
}

pub fn mutation_batch_key(batch_id: i32) -> String {
    format!("{MUTATIONS_PREFIX}{batch_id:010}")
}

pub fn overlay_key(key: &DocumentKey) -> String {
    format!("{DOCUMENT_OVERLAYS_PREFIX}{key}")
}

pub fn target_key(target_id: i32) -> String {
    format!("{TARGETS_PREFIX}{target_id:010}")
}

pub fn target_documents_key(target_id: i32) -> String {
    format!("{TARGET_DOCUMENTS_PREFIX}{target_id:010}")
}

fn purpose_name(purpose: TargetPurpose) -> &'static str {
    match purpose {
        TargetPurpose::Listen => "listen",
        TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
        TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
        TargetPurpose::LimboResolution => "limbo-resolution",
    }
}

fn parse_purpose(name: Option<&str>) -> TargetPurpose {
    match name {
        Some("existence-filter-mismatch") => TargetPurpose::ExistenceFilterMismatch,
        Some("existence-filter-mismatch-bloom") => TargetPurpose::ExistenceFilterMismatchBloom,
        Some("limbo-resolution") => TargetPurpose::LimboResolution,
        _ => TargetPurpose::Listen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Direction, FieldFilter, FilterOperator, Query};
    use crate::firestore::model::{DatabaseId, FieldPath, Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        map
    }

    #[test]
    fn remote_documents_keep_state_and_read_time() {
        let serializer = serializer();
        let mut doc = MutableDocument::new_found_document(key("rooms/a"), SnapshotVersion::from_micros(5_000_000), data("n", 1));
        doc.set_read_time(SnapshotVersion::from_micros(7_000_000));
        let decoded = serializer
            .decode_remote_document(&serializer.encode_remote_document(&doc))
            .unwrap();
        assert_eq!(decoded, doc);

        let mut unknown = MutableDocument::new_unknown_document(key("rooms/b"), SnapshotVersion::from_micros(9_000_000));
        unknown.set_read_time(SnapshotVersion::from_micros(9_000_000));
        let decoded = serializer
            .decode_remote_document(&serializer.encode_remote_document(&unknown))
            .unwrap();
        assert!(decoded.is_unknown_document());
        assert!(decoded.has_committed_mutations());
    }

    #[test]
    fn mutation_batches_keep_base_mutations() {
        let serializer = serializer();
        let batch = MutationBatch::new(
            4,
            Timestamp::new(1_700_000_000, 0),
            vec![Mutation::patch(key("rooms/a"), data("n", 1), data("n", 1).field_mask())],
            vec![Mutation::set(key("rooms/a"), data("n", 2)), Mutation::delete(key("rooms/b"))],
        );
        let decoded = serializer
            .decode_mutation_batch(&serializer.encode_mutation_batch(&batch))
            .unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn target_data_keeps_query_and_resume_token() {
        let serializer = serializer();
        let target = Query::collection("rooms")
            .unwrap()
            .with_filter(FieldFilter::new(
                FieldPath::from_dot_separated("size").unwrap(),
                FilterOperator::GreaterThan,
                FirestoreValue::from_integer(3),
            ))
            .order_by(FieldPath::from_dot_separated("size").unwrap(), Direction::Descending)
            .limit_to_first(5)
            .to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 11)
            .with_resume_token(b"resume".to_vec(), SnapshotVersion::from_micros(3_000_000));
        let decoded = serializer
            .decode_target_data(&serializer.encode_target_data(&data))
            .unwrap();
        assert_eq!(decoded, data);

        let doc_target = TargetData::new(Target::for_document(&key("rooms/a")), 4, TargetPurpose::Listen, 1);
        let decoded = serializer
            .decode_target_data(&serializer.encode_target_data(&doc_target))
            .unwrap();
        assert!(decoded.target.is_document_target());
    }

    #[test]
    fn pending_writes_split_by_namespace() {
        let serializer = serializer();
        let writes = vec![
            PendingWrite::RemoveRemoteDocument(key("rooms/a")),
            PendingWrite::RemoveMutationBatch(3),
            PendingWrite::RemoveTarget(2),
        ];
        let batch = serializer.encode_pending_writes(&writes, "p/d", "p/d/alice");
        assert_eq!(batch.ops().len(), 4);
    }

    #[test]
    fn corrupt_entries_report_data_loss() {
        let err = serializer().decode_remote_document(&json!({ "kind": "found" })).unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
    }
}
