use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::FirestoreResult;

/// Bidirectional RPCs carried by a persistent stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcKind {
    Listen,
    Write,
}

impl RpcKind {
    pub fn label(&self) -> &'static str {
        match self {
            RpcKind::Listen => "Listen",
            RpcKind::Write => "Write",
        }
    }
}

/// Request/response RPCs. Server-streaming responses arrive as a JSON array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryRpc {
    Commit,
    BatchGetDocuments,
    RunQuery,
}

impl UnaryRpc {
    pub fn label(&self) -> &'static str {
        match self {
            UnaryRpc::Commit => "Commit",
            UnaryRpc::BatchGetDocuments => "BatchGetDocuments",
            UnaryRpc::RunQuery => "RunQuery",
        }
    }
}

/// Client end of an open bidirectional stream.
#[async_trait]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()>;

    /// Next message from the server. `None` means the server closed the
    /// stream cleanly; `Some(Err)` carries the status it closed with.
    async fn next(&self) -> Option<FirestoreResult<JsonValue>>;

    async fn close(&self);
}

/// Transport to the backend. Framing and wire encoding live behind this trait;
/// everything above it exchanges the JSON mapping of the v1 protos.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(
        &self,
        kind: RpcKind,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;

    async fn invoke(
        &self,
        rpc: UnaryRpc,
        auth_token: Option<String>,
        request: JsonValue,
    ) -> FirestoreResult<JsonValue>;
}

/// Supplies the auth token attached to every stream and RPC.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);
}

#[derive(Default, Clone, Debug)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;
pub type ConnectionArc = Arc<dyn Connection>;
