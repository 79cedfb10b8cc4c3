use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::constants::STREAM_IDLE_TIMEOUT;
use crate::firestore::error::{
    hard_assert, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::remote::connection::{
    ConnectionArc, CredentialsProviderArc, RpcKind, StreamHandle,
};
use crate::platform::runtime;
use crate::util::{AsyncQueue, DelayedOperation, ExponentialBackoff, RetrySettings, TimerId};

/// How long an open stream may sit unused before it is closed.

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Healthy
///     ^          |         |        |
///     |          +---------+--------+--> Error -> Backoff -> Starting
///     +---- stop() / idle close
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    /// Open and at least one message received; backoff has been reset.
    Healthy,
    /// Closed by an error. The next `start` waits out the backoff first.
    Error,
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. Every callback runs on the
/// async queue.
#[async_trait]
pub trait PersistentStreamDelegate: Send + Sync + 'static {
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;

    /// `error` is `None` only when the stream was stopped locally.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamInner {
    state: StreamState,
    /// Bumped on every close so events from a previous connection are ignored.
    close_count: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedOperation>,
    backoff: ExponentialBackoff,
}

struct PersistentStreamShared {
    kind: RpcKind,
    idle_timer_id: TimerId,
    queue: AsyncQueue,
    connection: ConnectionArc,
    credentials: CredentialsProviderArc,
    delegate: Arc<dyn PersistentStreamDelegate>,
    inner: Mutex<StreamInner>,
}

/// A stream that reconnects with exponential backoff, closes itself when
/// idle and reports its lifecycle to a delegate.
///
/// Methods are meant to be called from operations running on the async
/// queue; network I/O runs on detached tasks that re-enter the queue.
#[derive(Clone)]
pub struct PersistentStream {
    shared: Arc<PersistentStreamShared>,
}

impl PersistentStream {
    pub fn new(
        kind: RpcKind,
        queue: AsyncQueue,
        connection: ConnectionArc,
        credentials: CredentialsProviderArc,
        retry: RetrySettings,
        delegate: Arc<dyn PersistentStreamDelegate>,
    ) -> Self {
        let (idle_timer_id, backoff_timer_id) = match kind {
            RpcKind::Listen => (TimerId::ListenStreamIdle, TimerId::ListenStreamConnectionBackoff),
            RpcKind::Write => (TimerId::WriteStreamIdle, TimerId::WriteStreamConnectionBackoff),
        };
        let backoff = ExponentialBackoff::new(queue.clone(), backoff_timer_id, retry);
        Self {
            shared: Arc::new(PersistentStreamShared {
                kind,
                idle_timer_id,
                queue,
                connection,
                credentials,
                delegate,
                inner: Mutex::new(StreamInner {
                    state: StreamState::Initial,
                    close_count: 0,
                    handle: None,
                    idle_timer: None,
                    backoff,
                }),
            }),
        }
    }

    pub fn kind(&self) -> RpcKind {
        self.shared.kind
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// True from `start` until the stream is stopped or fails.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Backoff | StreamState::Open | StreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Healthy)
    }

    /// Opens the stream. After an error the attempt is delayed by the backoff.
    pub fn start(&self) {
        let close_count = {
            let mut inner = self.lock();
            match inner.state {
                StreamState::Error => {
                    self.perform_backoff(&mut inner);
                    return;
                }
                StreamState::Initial => {}
                state => {
                    log::debug!("{} stream already started ({state:?})", self.shared.kind.label());
                    return;
                }
            }
            inner.state = StreamState::Starting;
            inner.close_count
        };

        let stream = self.clone();
        runtime::spawn_detached(async move {
            let shared = Arc::clone(&stream.shared);
            let result = match shared.credentials.get_token().await {
                Ok(token) => shared.connection.open_stream(shared.kind, token).await,
                Err(err) => Err(err),
            };
            shared
                .queue
                .enqueue_and_forget(async move { stream.handle_open_result(close_count, result).await });
        });
    }

    /// Closes the stream without an error. The delegate sees `on_close(None)`.
    pub async fn stop(&self) -> FirestoreResult<()> {
        if self.is_started() {
            self.close(None).await
        } else {
            Ok(())
        }
    }

    /// Lets the next `start` connect right away even though the last close was
    /// an error.
    pub fn inhibit_backoff(&self) -> FirestoreResult<()> {
        let mut inner = self.lock();
        hard_assert(
            !matches!(
                inner.state,
                StreamState::Starting | StreamState::Backoff | StreamState::Open | StreamState::Healthy
            ),
            || "Can only inhibit backoff in a stopped state".to_string(),
        )?;
        inner.state = StreamState::Initial;
        inner.backoff.reset();
        Ok(())
    }

    /// Runs a pending reconnect attempt immediately.
    pub fn skip_backoff(&self) {
        self.lock().backoff.skip_backoff();
    }

    /// Schedules the stream to close after [`STREAM_IDLE_TIMEOUT`] unless it is used
    /// again in the meantime.
    pub fn mark_idle(&self) {
        let mut inner = self.lock();
        let open = matches!(inner.state, StreamState::Open | StreamState::Healthy);
        if open && inner.idle_timer.is_none() {
            let stream = self.clone();
            inner.idle_timer = Some(self.shared.queue.enqueue_after_delay(
                self.shared.idle_timer_id,
                STREAM_IDLE_TIMEOUT,
                move || async move { stream.handle_idle_close().await },
            ));
        }
    }

    /// Sends one message on the open stream.
    pub async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(message).await,
            None => Err(unavailable(format!("{} stream is not open", self.shared.kind.label()))),
        }
    }

    async fn handle_open_result(
        &self,
        close_count: u64,
        result: FirestoreResult<Arc<dyn StreamHandle>>,
    ) -> FirestoreResult<()> {
        let outcome = {
            let mut inner = self.lock();
            if inner.close_count != close_count {
                // Stopped while connecting.
                if let Ok(handle) = result {
                    runtime::spawn_detached(async move { handle.close().await });
                }
                return Ok(());
            }
            if let Ok(handle) = &result {
                inner.state = StreamState::Open;
                inner.handle = Some(Arc::clone(handle));
            }
            result
        };
        let handle = match outcome {
            Ok(handle) => handle,
            Err(err) => return self.close(Some(err)).await,
        };
        log::debug!("{} stream opened", self.shared.kind.label());
        self.spawn_reader(handle, close_count);
        self.shared.delegate.on_open().await
    }

    fn spawn_reader(&self, handle: Arc<dyn StreamHandle>, close_count: u64) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                match handle.next().await {
                    Some(Ok(message)) => {
                        let target = stream.clone();
                        stream.shared.queue.enqueue_and_forget(async move {
                            target.handle_message(close_count, message).await
                        });
                    }
                    other => {
                        let error = match other {
                            Some(Err(err)) => err,
                            _ => unavailable("Stream closed by the backend"),
                        };
                        let target = stream.clone();
                        stream.shared.queue.enqueue_and_forget(async move {
                            target.handle_stream_close(close_count, error).await
                        });
                        break;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, close_count: u64, message: JsonValue) -> FirestoreResult<()> {
        {
            let mut inner = self.lock();
            if inner.close_count != close_count {
                return Ok(());
            }
            if inner.state == StreamState::Open {
                inner.state = StreamState::Healthy;
                inner.backoff.reset();
            }
        }
        if let Err(err) = self.shared.delegate.on_message(message).await {
            log::warn!("{} stream message handling failed: {err}", self.shared.kind.label());
            if self.lock().close_count == close_count {
                return self.close(Some(err)).await;
            }
        }
        Ok(())
    }

    async fn handle_stream_close(&self, close_count: u64, error: FirestoreError) -> FirestoreResult<()> {
        if self.lock().close_count != close_count {
            return Ok(());
        }
        self.close(Some(error)).await
    }

    async fn handle_idle_close(&self) -> FirestoreResult<()> {
        {
            let mut inner = self.lock();
            inner.idle_timer = None;
        }
        if self.is_open() {
            log::debug!("closing idle {} stream", self.shared.kind.label());
            return self.close(None).await;
        }
        Ok(())
    }

    async fn close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner.backoff.cancel();
            inner.close_count += 1;

            match error.as_ref().map(|err| err.code) {
                Some(FirestoreErrorCode::ResourceExhausted) => {
                    log::warn!(
                        "{} stream hit a quota; using the maximum backoff",
                        self.shared.kind.label()
                    );
                    inner.backoff.reset_to_max();
                }
                Some(FirestoreErrorCode::Unauthenticated) => {
                    log::debug!("{} stream unauthenticated; refreshing credentials", self.shared.kind.label());
                    self.shared.credentials.invalidate_token();
                }
                _ => {}
            }

            if error.is_some() {
                inner.state = StreamState::Error;
            } else {
                // A deliberate close reconnects without delay.
                inner.backoff.reset();
                inner.state = StreamState::Initial;
            }
            inner.handle.take()
        };

        if let Some(handle) = handle {
            handle.close().await;
        }
        match &error {
            Some(err) => log::debug!("{} stream closed: {err}", self.shared.kind.label()),
            None => log::debug!("{} stream stopped", self.shared.kind.label()),
        }
        self.shared.delegate.on_close(error).await
    }

    fn perform_backoff(&self, inner: &mut StreamInner) {
        inner.state = StreamState::Backoff;
        let stream = self.clone();
        inner.backoff.backoff_and_run(move || async move {
            {
                let mut inner = stream.lock();
                if inner.state != StreamState::Backoff {
                    return Ok(());
                }
                inner.state = StreamState::Initial;
            }
            stream.start();
            Ok(())
        });
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::firestore::error::{resource_exhausted, unauthenticated};
    use crate::firestore::remote::connection::CredentialsProvider;
    use crate::firestore::remote::stream::{loopback, LoopbackServer, ServerEvent, ServerStream};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        messages: Mutex<Vec<JsonValue>>,
        closes: Mutex<Vec<Option<FirestoreErrorCode>>>,
    }

    #[async_trait]
    impl PersistentStreamDelegate for Recorder {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            self.closes.lock().unwrap().push(error.map(|err| err.code));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingCredentials {
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl CredentialsProvider for CountingCredentials {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some(format!("token-{}", self.invalidations.load(Ordering::SeqCst))))
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        stream: PersistentStream,
        recorder: Arc<Recorder>,
        credentials: Arc<CountingCredentials>,
        server: LoopbackServer,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let (connection, server) = loopback();
        let recorder = Arc::new(Recorder::default());
        let credentials = Arc::new(CountingCredentials::default());
        let stream = PersistentStream::new(
            RpcKind::Listen,
            queue.clone(),
            Arc::new(connection),
            credentials.clone(),
            RetrySettings::default(),
            recorder.clone(),
        );
        Fixture {
            queue,
            stream,
            recorder,
            credentials,
            server,
        }
    }

    async fn accept_stream(server: &LoopbackServer) -> ServerStream {
        match server.accept().await {
            Some(ServerEvent::Stream(stream)) => stream,
            _ => panic!("expected a stream"),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn start_on_queue(fixture: &Fixture) {
        let stream = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                stream.start();
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opens_and_becomes_healthy_after_first_message() {
        let fixture = fixture();
        start_on_queue(&fixture).await;
        let server_stream = accept_stream(&fixture.server).await;
        assert_eq!(server_stream.auth_token(), Some("token-0"));
        eventually(|| fixture.recorder.opens.load(Ordering::SeqCst) == 1).await;
        assert_eq!(fixture.stream.state(), StreamState::Open);

        server_stream.send(json!({"n": 1})).await.unwrap();
        eventually(|| fixture.recorder.messages.lock().unwrap().len() == 1).await;
        assert_eq!(fixture.stream.state(), StreamState::Healthy);

        let stream = fixture.stream.clone();
        fixture.queue.enqueue(async move { stream.stop().await }).await.unwrap();
        assert_eq!(fixture.stream.state(), StreamState::Initial);
        assert_eq!(*fixture.recorder.closes.lock().unwrap(), vec![None]);
        assert!(server_stream.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_close_backs_off_before_reconnecting() {
        let fixture = fixture();
        start_on_queue(&fixture).await;
        let first = accept_stream(&fixture.server).await;
        eventually(|| fixture.stream.is_open()).await;

        first.fail(unavailable("connection reset")).await;
        eventually(|| fixture.stream.state() == StreamState::Error).await;
        assert_eq!(
            *fixture.recorder.closes.lock().unwrap(),
            vec![Some(FirestoreErrorCode::Unavailable)]
        );

        // The first retry after a fresh start runs without delay.
        start_on_queue(&fixture).await;
        let second = accept_stream(&fixture.server).await;
        eventually(|| fixture.recorder.opens.load(Ordering::SeqCst) == 2).await;

        second.fail(unavailable("connection reset")).await;
        eventually(|| fixture.stream.state() == StreamState::Error).await;
        start_on_queue(&fixture).await;
        assert_eq!(fixture.stream.state(), StreamState::Backoff);
        assert!(fixture
            .queue
            .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        fixture
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        let _third = accept_stream(&fixture.server).await;
        eventually(|| fixture.recorder.opens.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthenticated_close_invalidates_credentials() {
        let fixture = fixture();
        start_on_queue(&fixture).await;
        let first = accept_stream(&fixture.server).await;
        eventually(|| fixture.stream.is_open()).await;
        first.fail(unauthenticated("token expired")).await;
        eventually(|| fixture.stream.state() == StreamState::Error).await;
        assert_eq!(fixture.credentials.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resource_exhausted_uses_maximum_backoff() {
        let fixture = fixture();
        start_on_queue(&fixture).await;
        let first = accept_stream(&fixture.server).await;
        eventually(|| fixture.stream.is_open()).await;
        first.fail(resource_exhausted("quota")).await;
        eventually(|| fixture.stream.state() == StreamState::Error).await;
        assert_eq!(
            fixture.stream.lock().backoff.current_base(),
            RetrySettings::default().max_delay
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_stream_closes_after_timeout() {
        let fixture = fixture();
        start_on_queue(&fixture).await;
        let _server_stream = accept_stream(&fixture.server).await;
        eventually(|| fixture.stream.is_open()).await;

        let stream = fixture.stream.clone();
        fixture
            .queue
            .enqueue(async move {
                stream.mark_idle();
                Ok(())
            })
            .await
            .unwrap();
        assert!(fixture.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        fixture
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamIdle)
            .await
            .unwrap();
        assert_eq!(fixture.stream.state(), StreamState::Initial);
        assert_eq!(*fixture.recorder.closes.lock().unwrap(), vec![None]);
    }
}
