use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{hard_assert, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::connection::{ConnectionArc, CredentialsProviderArc, RpcKind};
use crate::firestore::remote::serializer::{decode_bytes, encode_bytes, JsonProtoSerializer};
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate};
use crate::util::{AsyncQueue, RetrySettings};

/// Receives decoded events of the write stream.
#[async_trait]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()>;

    /// Results of the oldest batch written and not yet acknowledged.
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Debug, Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

type SharedWriteState = Arc<Mutex<WriteStreamState>>;

fn lock_state(state: &SharedWriteState) -> MutexGuard<'_, WriteStreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The `Write` RPC.
///
/// After the stream opens the client sends a handshake; the server answers
/// with a stream token. Every later request carries the latest token plus one
/// batch of writes, and every response acknowledges the oldest outstanding
/// batch in order.
#[derive(Clone)]
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    state: SharedWriteState,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        retry: RetrySettings,
        serializer: JsonProtoSerializer,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Self {
        let state = SharedWriteState::default();
        let handler = Arc::new(WriteStreamHandler {
            serializer: serializer.clone(),
            state: Arc::clone(&state),
            listener,
        });
        let stream = PersistentStream::new(RpcKind::Write, queue, connection, credentials, retry, handler);
        Self {
            stream,
            serializer,
            state,
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn handshake_complete(&self) -> bool {
        lock_state(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock_state(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock_state(&self.state).last_stream_token = token;
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        hard_assert(self.stream.is_open(), || "Writing handshake requires an opened stream".to_string())?;
        hard_assert(!self.handshake_complete(), || "Handshake already completed".to_string())?;
        self.stream
            .send(json!({ "database": self.serializer.database_name() }))
            .await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        hard_assert(self.stream.is_open(), || "Writing mutations requires an opened stream".to_string())?;
        hard_assert(self.handshake_complete(), || {
            "Handshake must be complete before writing mutations".to_string()
        })?;
        let request = json!({
            "streamToken": encode_bytes(&self.last_stream_token()),
            "writes": mutations
                .iter()
                .map(|mutation| self.serializer.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        });
        self.stream.send(request).await
    }
}

struct WriteStreamHandler {
    serializer: JsonProtoSerializer,
    state: SharedWriteState,
    listener: Weak<dyn WriteStreamListener>,
}

#[async_trait]
impl PersistentStreamDelegate for WriteStreamHandler {
    async fn on_open(&self) -> FirestoreResult<()> {
        lock_state(&self.state).handshake_complete = false;
        match self.listener.upgrade() {
            Some(listener) => listener.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let stream_token = decode_bytes(message.get("streamToken"))?;
        let write_results = message
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();

        let was_handshake = {
            let mut state = lock_state(&self.state);
            state.last_stream_token = stream_token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };

        if was_handshake {
            hard_assert(write_results.is_empty(), || {
                "Got mutation results for the handshake".to_string()
            })?;
            return listener.on_write_handshake_complete().await;
        }

        let commit_version = self.serializer.decode_version(message.get("commitTime"))?;
        let results = write_results
            .iter()
            .map(|result| self.serializer.decode_write_result(result, commit_version))
            .collect::<FirestoreResult<Vec<_>>>()?;
        listener.on_mutation_result(commit_version, results).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

/// A decoded `WriteRequest`, as seen by the server. The handshake has no
/// writes and no token.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub stream_token: Vec<u8>,
    pub writes: Vec<Mutation>,
}

impl WriteRequest {
    pub fn is_handshake(&self) -> bool {
        self.stream_token.is_empty() && self.writes.is_empty()
    }
}

pub fn decode_write_request(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WriteRequest> {
    let writes = match value.get("writes").and_then(JsonValue::as_array) {
        Some(writes) => writes
            .iter()
            .map(|write| serializer.decode_mutation(write))
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(WriteRequest {
        stream_token: decode_bytes(value.get("streamToken"))?,
        writes,
    })
}

/// `WriteResponse` acknowledging one batch (or the handshake when `results`
/// is empty and `commit_version` is `None`).
pub fn encode_write_response(
    serializer: &JsonProtoSerializer,
    stream_token: &[u8],
    commit_version: Option<SnapshotVersion>,
    results: &[MutationResult],
) -> JsonValue {
    let mut response = serde_json::Map::new();
    response.insert("streamToken".into(), json!(encode_bytes(stream_token)));
    if let Some(version) = commit_version {
        response.insert("commitTime".into(), json!(serializer.encode_version(&version)));
        response.insert(
            "writeResults".into(),
            JsonValue::Array(results.iter().map(|result| serializer.encode_write_result(result)).collect()),
        );
    }
    JsonValue::Object(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, DocumentKey, Precondition};
    use crate::firestore::value::MapValue;

    #[test]
    fn write_request_keeps_mutation_order_and_token() {
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let first = Mutation::set(DocumentKey::from_string("rooms/a").unwrap(), MapValue::empty());
        let second = Mutation::delete(DocumentKey::from_string("rooms/b").unwrap())
            .with_precondition(Precondition::Exists(true));
        let request = json!({
            "streamToken": encode_bytes(b"token-1"),
            "writes": [serializer.encode_mutation(&first), serializer.encode_mutation(&second)],
        });
        let decoded = decode_write_request(&serializer, &request).unwrap();
        assert!(!decoded.is_handshake());
        assert_eq!(decoded.stream_token, b"token-1".to_vec());
        assert_eq!(decoded.writes, vec![first, second]);

        let handshake = decode_write_request(&serializer, &json!({"database": "projects/p/databases/(default)"})).unwrap();
        assert!(handshake.is_handshake());
    }

    #[test]
    fn write_response_carries_commit_time_and_results() {
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let commit = SnapshotVersion::from_micros(7_000_000);
        let response = encode_write_response(
            &serializer,
            b"token-2",
            Some(commit),
            &[MutationResult {
                version: commit,
                transform_results: Vec::new(),
            }],
        );
        assert_eq!(decode_bytes(response.get("streamToken")).unwrap(), b"token-2".to_vec());
        assert_eq!(serializer.decode_version(response.get("commitTime")).unwrap(), commit);
        assert_eq!(response["writeResults"].as_array().map(Vec::len), Some(1));

        let handshake = encode_write_response(&serializer, b"token-0", None, &[]);
        assert!(handshake.get("writeResults").is_none());
    }
}
