//! Persistent stream machinery plus an in-process loopback transport.
//!
//! The loopback pairs a client-side [`Connection`] with a [`LoopbackServer`]
//! that receives every stream and call the client opens. Tests drive the
//! server end to play the backend.

pub mod persistent;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use futures::channel::oneshot;
use serde_json::Value as JsonValue;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::connection::{Connection, RpcKind, StreamHandle, UnaryRpc};

pub use persistent::{PersistentStream, PersistentStreamDelegate, StreamState};

#[derive(Clone, Debug)]
pub enum FrameKind {
    Data(JsonValue),
    Close,
    Error(FirestoreError),
}

/// What a client asked the loopback server for.
pub enum ServerEvent {
    Stream(ServerStream),
    Call(UnaryCall),
}

/// Creates a connected client/server pair.
pub fn loopback() -> (LoopbackConnection, LoopbackServer) {
    let (incoming_tx, incoming_rx) = async_channel::unbounded();
    let connection = LoopbackConnection {
        incoming: incoming_tx,
        reachable: Arc::new(AtomicBool::new(true)),
    };
    (connection, LoopbackServer { incoming: incoming_rx })
}

/// Client end of the loopback transport.
#[derive(Clone)]
pub struct LoopbackConnection {
    incoming: Sender<ServerEvent>,
    reachable: Arc<AtomicBool>,
}

impl LoopbackConnection {
    /// Simulates losing (or regaining) the network. While unreachable every
    /// open and call fails with `Unavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> FirestoreResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(unavailable("The backend is unreachable"))
        }
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn open_stream(
        &self,
        kind: RpcKind,
        auth_token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.check_reachable()?;
        let (to_server_tx, to_server_rx) = async_channel::unbounded();
        let (to_client_tx, to_client_rx) = async_channel::unbounded();
        let server_stream = ServerStream {
            kind,
            auth_token,
            inbound: to_server_rx,
            outbound: to_client_tx,
        };
        self.incoming
            .send(ServerEvent::Stream(server_stream))
            .await
            .map_err(|_| unavailable("The backend is not accepting streams"))?;
        log::debug!("opened loopback {} stream", kind.label());
        Ok(Arc::new(LoopbackStream {
            outbound: to_server_tx,
            inbound: to_client_rx,
        }))
    }

    async fn invoke(
        &self,
        rpc: UnaryRpc,
        auth_token: Option<String>,
        request: JsonValue,
    ) -> FirestoreResult<JsonValue> {
        self.check_reachable()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let call = UnaryCall {
            rpc,
            auth_token,
            request,
            reply: reply_tx,
        };
        self.incoming
            .send(ServerEvent::Call(call))
            .await
            .map_err(|_| unavailable("The backend is not accepting calls"))?;
        reply_rx
            .await
            .map_err(|_| unavailable(format!("{} call was dropped by the backend", rpc.label())))?
    }
}

struct LoopbackStream {
    outbound: Sender<FrameKind>,
    inbound: Receiver<FrameKind>,
}

#[async_trait]
impl StreamHandle for LoopbackStream {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .send(FrameKind::Data(message))
            .await
            .map_err(|_| unavailable("Stream closed by the backend"))
    }

    async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        match self.inbound.recv().await {
            Ok(FrameKind::Data(message)) => Some(Ok(message)),
            Ok(FrameKind::Error(err)) => Some(Err(err)),
            Ok(FrameKind::Close) => None,
            // Either end dropped the stream without a status.
            Err(_) => Some(Err(unavailable("Stream disconnected"))),
        }
    }

    async fn close(&self) {
        let _ = self.outbound.send(FrameKind::Close).await;
        self.outbound.close();
        self.inbound.close();
    }
}

/// Accepts the streams and calls opened by a [`LoopbackConnection`].
pub struct LoopbackServer {
    incoming: Receiver<ServerEvent>,
}

impl LoopbackServer {
    /// Waits for the next stream or call. `None` once every client is gone.
    pub async fn accept(&self) -> Option<ServerEvent> {
        self.incoming.recv().await.ok()
    }
}

/// Server end of a loopback stream.
pub struct ServerStream {
    kind: RpcKind,
    auth_token: Option<String>,
    inbound: Receiver<FrameKind>,
    outbound: Sender<FrameKind>,
}

impl ServerStream {
    pub fn kind(&self) -> RpcKind {
        self.kind
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Next client message, or `None` once the client closed the stream.
    pub async fn next(&self) -> Option<JsonValue> {
        match self.inbound.recv().await {
            Ok(FrameKind::Data(message)) => Some(message),
            _ => None,
        }
    }

    pub async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .send(FrameKind::Data(message))
            .await
            .map_err(|_| unavailable("Stream closed by the client"))
    }

    /// Closes the stream with an error status.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.outbound.send(FrameKind::Error(error)).await;
        self.outbound.close();
    }

    pub async fn close(&self) {
        let _ = self.outbound.send(FrameKind::Close).await;
        self.outbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// A unary call awaiting the server's reply.
pub struct UnaryCall {
    pub rpc: UnaryRpc,
    pub auth_token: Option<String>,
    pub request: JsonValue,
    reply: oneshot::Sender<FirestoreResult<JsonValue>>,
}

impl UnaryCall {
    pub fn respond(self, response: FirestoreResult<JsonValue>) {
        let _ = self.reply.send(response);
    }
}
