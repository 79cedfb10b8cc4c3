use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::connection::{ConnectionArc, CredentialsProviderArc, RpcKind};
use crate::firestore::remote::serializer::{decode_bytes, encode_bytes, JsonProtoSerializer};
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate};
use crate::firestore::remote::structured_query::{
    decode_target, encode_documents_target, encode_query_target,
};
use crate::firestore::remote::watch_change::{decode_watch_change, TargetChangeState, WatchChange};
use crate::util::{AsyncQueue, RetrySettings};

const LISTEN_TAGS_LABEL: &str = "goog-listen-tags";

/// Receives decoded events of the listen stream.
#[async_trait]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is non-minimal only for a global `NO_CHANGE`, which
    /// marks a point where every target is consistent.
    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The `Listen` RPC: adds and removes targets and reports watch changes.
#[derive(Clone)]
pub struct ListenStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl ListenStream {
    pub fn new(
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        retry: RetrySettings,
        serializer: JsonProtoSerializer,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Self {
        let handler = Arc::new(ListenStreamHandler {
            serializer: serializer.clone(),
            listener,
        });
        let stream = PersistentStream::new(RpcKind::Listen, queue, connection, credentials, retry, handler);
        Self { stream, serializer }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    /// Starts watching `target_data.target` under its target id.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = encode_listen_request(&self.serializer, target_data);
        log::debug!("watch target {}", target_data.target_id);
        self.stream.send(request).await
    }

    pub async fn unwatch(&self, target_id: i32) -> FirestoreResult<()> {
        log::debug!("unwatch target {target_id}");
        self.stream
            .send(json!({
                "database": self.serializer.database_name(),
                "removeTarget": target_id,
            }))
            .await
    }
}

struct ListenStreamHandler {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

#[async_trait]
impl PersistentStreamDelegate for ListenStreamHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let Some(change) = decode_watch_change(&self.serializer, &message)? else {
            log::debug!("ignoring unrecognized listen response");
            return Ok(());
        };
        let snapshot_version = snapshot_version_of(&change);
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

fn snapshot_version_of(change: &WatchChange) -> SnapshotVersion {
    match change {
        WatchChange::TargetChange(change)
            if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
        {
            change.read_time
        }
        _ => SnapshotVersion::min(),
    }
}

/// `ListenRequest` adding a target. A resume token takes precedence over a
/// read time; the expected count is only meaningful with either.
pub fn encode_listen_request(serializer: &JsonProtoSerializer, target_data: &TargetData) -> JsonValue {
    let target = &target_data.target;
    let mut add_target = serde_json::Map::new();
    add_target.insert("targetId".into(), json!(target_data.target_id));
    if target.is_document_target() {
        add_target.insert("documents".into(), encode_documents_target(serializer, target));
    } else {
        add_target.insert("query".into(), encode_query_target(serializer, target));
    }
    if !target_data.resume_token.is_empty() {
        add_target.insert("resumeToken".into(), json!(encode_bytes(&target_data.resume_token)));
    } else if !target_data.snapshot_version.is_min() {
        add_target.insert(
            "readTime".into(),
            json!(serializer.encode_version(&target_data.snapshot_version)),
        );
    }
    if let Some(count) = target_data.expected_count {
        add_target.insert("expectedCount".into(), json!(count));
    }

    let mut request = serde_json::Map::new();
    request.insert("database".into(), json!(serializer.database_name()));
    request.insert("addTarget".into(), JsonValue::Object(add_target));
    if let Some(label) = target_data.purpose.listen_label() {
        request.insert("labels".into(), json!({ LISTEN_TAGS_LABEL: label }));
    }
    JsonValue::Object(request)
}

/// A decoded `ListenRequest`, as seen by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenRequest {
    AddTarget {
        target_id: i32,
        target: Target,
        resume_token: Vec<u8>,
        read_time: SnapshotVersion,
        expected_count: Option<i32>,
        label: Option<String>,
    },
    RemoveTarget(i32),
}

pub fn decode_listen_request(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<ListenRequest> {
    if let Some(target_id) = value.get("removeTarget") {
        let target_id = target_id
            .as_i64()
            .ok_or_else(|| invalid_argument("removeTarget must be a target id"))?;
        return Ok(ListenRequest::RemoveTarget(target_id as i32));
    }
    let add_target = value
        .get("addTarget")
        .ok_or_else(|| invalid_argument("ListenRequest carries neither addTarget nor removeTarget"))?;
    let target_id = add_target
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("addTarget missing targetId"))? as i32;
    Ok(ListenRequest::AddTarget {
        target_id,
        target: decode_target(serializer, add_target)?,
        resume_token: decode_bytes(add_target.get("resumeToken"))?,
        read_time: serializer.decode_version(add_target.get("readTime"))?,
        expected_count: add_target
            .get("expectedCount")
            .and_then(JsonValue::as_i64)
            .map(|count| count as i32),
        label: value
            .get("labels")
            .and_then(|labels| labels.get(LISTEN_TAGS_LABEL))
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{DatabaseId, DocumentKey};
    use crate::firestore::remote::watch_change::WatchTargetChange;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    #[test]
    fn resume_token_wins_over_read_time() {
        let serializer = serializer();
        let target = Query::collection("rooms").unwrap().to_target();
        let target_data = TargetData::new(target.clone(), 4, TargetPurpose::Listen, 1)
            .with_resume_token(b"resume".to_vec(), SnapshotVersion::from_micros(1_000_000))
            .with_expected_count(3);
        let request = encode_listen_request(&serializer, &target_data);
        assert!(request["addTarget"].get("readTime").is_none());
        assert!(request.get("labels").is_none());

        let ListenRequest::AddTarget {
            target_id,
            target: decoded,
            resume_token,
            expected_count,
            ..
        } = decode_listen_request(&serializer, &request).unwrap()
        else {
            panic!("expected addTarget");
        };
        assert_eq!(target_id, 4);
        assert_eq!(decoded, target);
        assert_eq!(resume_token, b"resume".to_vec());
        assert_eq!(expected_count, Some(3));
    }

    #[test]
    fn limbo_targets_carry_document_payload_and_label() {
        let serializer = serializer();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target_data = TargetData::new(Target::for_document(&key), 3, TargetPurpose::LimboResolution, 1);
        let request = encode_listen_request(&serializer, &target_data);
        assert_eq!(
            request["addTarget"]["documents"]["documents"][0],
            json!("projects/p/databases/(default)/documents/rooms/a")
        );
        let ListenRequest::AddTarget { label, target, .. } =
            decode_listen_request(&serializer, &request).unwrap()
        else {
            panic!("expected addTarget");
        };
        assert_eq!(label.as_deref(), Some("limbo-document"));
        assert!(target.is_document_target());
    }

    #[test]
    fn remove_target_decodes() {
        let request = json!({"database": "projects/p/databases/(default)", "removeTarget": 7});
        assert_eq!(
            decode_listen_request(&serializer(), &request).unwrap(),
            ListenRequest::RemoveTarget(7)
        );
    }

    #[test]
    fn only_global_no_change_carries_a_snapshot_version() {
        let version = SnapshotVersion::from_micros(5_000_000);
        let global = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(version),
        );
        assert_eq!(snapshot_version_of(&global), version);
        let scoped = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, vec![2]).with_read_time(version),
        );
        assert!(snapshot_version_of(&scoped).is_min());
        let current = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, Vec::new()).with_read_time(version),
        );
        assert!(snapshot_version_of(&current).is_min());
    }
}
