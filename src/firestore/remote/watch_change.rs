use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::rpc_error::{decode_status, encode_status};
use crate::firestore::remote::serializer::{decode_bytes, encode_bytes, JsonProtoSerializer};

/// One message of the listen stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

impl TargetChangeState {
    fn as_str(&self) -> &'static str {
        match self {
            TargetChangeState::NoChange => "NO_CHANGE",
            TargetChangeState::Added => "ADD",
            TargetChangeState::Removed => "REMOVE",
            TargetChangeState::Current => "CURRENT",
            TargetChangeState::Reset => "RESET",
        }
    }

    fn from_str(value: &str) -> Self {
        match value {
            "ADD" => TargetChangeState::Added,
            "REMOVE" => TargetChangeState::Removed,
            "CURRENT" => TargetChangeState::Current,
            "RESET" => TargetChangeState::Reset,
            _ => TargetChangeState::NoChange,
        }
    }
}

/// State change of a set of targets. An empty `target_ids` list addresses
/// every target.
#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered, changed or left some targets.
///
/// `new_doc` is a found document for `documentChange`, a no-document for
/// `documentDelete` and absent for `documentRemove`.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub new_doc: Option<MutableDocument>,
}

/// Serialized Bloom filter of the document names the backend still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnchangedNames {
    /// Base64 bitmap, decoded lazily so a malformed filter only degrades the
    /// existence check.
    pub bitmap: String,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    pub unchanged_names: Option<UnchangedNames>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(change) = value.get("targetChange") {
        return decode_target_change(serializer, change).map(Some);
    }
    if let Some(change) = value.get("documentChange") {
        let document = change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange missing document"))?;
        let doc = serializer.decode_document(document)?;
        return Ok(Some(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: numeric_array(change.get("targetIds")),
            removed_target_ids: numeric_array(change.get("removedTargetIds")),
            key: doc.key().clone(),
            new_doc: Some(doc),
        })));
    }
    if let Some(change) = value.get("documentDelete") {
        let key = document_key(serializer, change, "documentDelete")?;
        let read_time = serializer.decode_version(change.get("readTime"))?;
        return Ok(Some(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: numeric_array(change.get("removedTargetIds")),
            new_doc: Some(MutableDocument::new_no_document(key.clone(), read_time)),
            key,
        })));
    }
    if let Some(change) = value.get("documentRemove") {
        let key = document_key(serializer, change, "documentRemove")?;
        return Ok(Some(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: numeric_array(change.get("removedTargetIds")),
            key,
            new_doc: None,
        })));
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter(filter).map(Some);
    }
    Ok(None)
}

/// Server-side encoding, used by loopback backends.
pub fn encode_watch_change(serializer: &JsonProtoSerializer, change: &WatchChange) -> JsonValue {
    match change {
        WatchChange::TargetChange(change) => {
            let mut body = JsonMap::new();
            body.insert("targetChangeType".into(), json!(change.state.as_str()));
            if !change.target_ids.is_empty() {
                body.insert("targetIds".into(), json!(change.target_ids));
            }
            if !change.resume_token.is_empty() {
                body.insert("resumeToken".into(), json!(encode_bytes(&change.resume_token)));
            }
            if !change.read_time.is_min() {
                body.insert("readTime".into(), json!(serializer.encode_version(&change.read_time)));
            }
            if let Some(cause) = &change.cause {
                body.insert("cause".into(), encode_status(cause));
            }
            json!({ "targetChange": JsonValue::Object(body) })
        }
        WatchChange::Document(change) => match &change.new_doc {
            Some(doc) if doc.is_found_document() => json!({
                "documentChange": {
                    "document": serializer.encode_document(doc),
                    "targetIds": change.updated_target_ids,
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            Some(doc) => json!({
                "documentDelete": {
                    "document": serializer.document_name(&change.key),
                    "readTime": serializer.encode_version(&doc.version()),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
            None => json!({
                "documentRemove": {
                    "document": serializer.document_name(&change.key),
                    "removedTargetIds": change.removed_target_ids,
                }
            }),
        },
        WatchChange::ExistenceFilter(filter) => {
            let mut body = JsonMap::new();
            body.insert("targetId".into(), json!(filter.target_id));
            body.insert("count".into(), json!(filter.count));
            if let Some(names) = &filter.unchanged_names {
                body.insert(
                    "unchangedNames".into(),
                    json!({
                        "bits": { "bitmap": names.bitmap, "padding": names.padding },
                        "hashCount": names.hash_count,
                    }),
                );
            }
            json!({ "filter": JsonValue::Object(body) })
        }
    }
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(TargetChangeState::from_str)
        .unwrap_or(TargetChangeState::NoChange);
    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: decode_bytes(value.get("resumeToken"))?,
        read_time: serializer.decode_version(value.get("readTime"))?,
        cause: value.get("cause").and_then(decode_status),
    }))
}

fn decode_filter(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as i32;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value.get("unchangedNames").map(|names| {
        let bits = names.get("bits");
        UnchangedNames {
            bitmap: bits
                .and_then(|bits| bits.get("bitmap"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            padding: bits
                .and_then(|bits| bits.get("padding"))
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32,
            hash_count: names.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
        }
    });
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<i32> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as i32))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": encode_bytes(&[1, 2, 3]),
                "targetChangeType": "CURRENT",
                "readTime": "1970-01-01T00:00:01Z"
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap().unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert_eq!(change.read_time, SnapshotVersion::from_micros(1_000_000));
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap().unwrap() {
            WatchChange::TargetChange(change) => {
                let cause = change.cause.unwrap();
                assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
                assert_eq!(cause.message(), "denied");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn document_delete_becomes_no_document() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let encoded = encode_watch_change(
            &serializer,
            &WatchChange::Document(DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key.clone(),
                new_doc: Some(MutableDocument::new_no_document(key.clone(), SnapshotVersion::from_micros(5))),
            }),
        );
        assert!(encoded.get("documentDelete").is_some());
        match decode_watch_change(&serializer, &encoded).unwrap().unwrap() {
            WatchChange::Document(change) => {
                assert_eq!(change.key, key);
                assert_eq!(change.removed_target_ids, vec![2]);
                assert!(change.new_doc.unwrap().is_no_document());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn keeps_bloom_filter_payload() {
        let filter = json!({
            "filter": {
                "targetId": 2,
                "count": 4,
                "unchangedNames": { "bits": { "bitmap": "AQI=", "padding": 3 }, "hashCount": 7 }
            }
        });
        match decode_watch_change(&serializer(), &filter).unwrap().unwrap() {
            WatchChange::ExistenceFilter(change) => {
                assert_eq!(change.count, 4);
                assert_eq!(
                    change.unchanged_names,
                    Some(UnchangedNames {
                        bitmap: "AQI=".to_string(),
                        padding: 3,
                        hash_count: 7,
                    })
                );
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_messages() {
        assert!(decode_watch_change(&serializer(), &json!({"other": {}})).unwrap().is_none());
    }
}
