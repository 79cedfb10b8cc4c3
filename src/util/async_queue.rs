use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;

type QueueTask = BoxFuture<'static, ()>;
type DelayedTask = Box<dyn FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send>;

/// Well-known timers, used to identify delayed operations in tests and to
/// fast-forward them deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
    TransactionRetry,
}

/// Serialized FIFO executor every component funnels its work through.
///
/// A single worker task drains a channel of boxed futures and runs each one to
/// completion before starting the next, so code running on the queue never
/// observes concurrent mutation of shared state. Network streams and timers live
/// on their own tasks and re-enter the queue with their results.
///
/// Operations running on the queue must not await another `enqueue` call: the
/// worker would wait on itself.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<QueueTask>,
    state: StdMutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    restricted: bool,
    next_delayed_id: u64,
    delayed: BTreeMap<u64, Arc<DelayedEntry>>,
}

struct DelayedEntry {
    timer_id: TimerId,
    target_time: Instant,
    task: StdMutex<Option<DelayedTask>>,
}

impl DelayedEntry {
    fn take_task(&self) -> Option<DelayedTask> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueueTask>();
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
            log::debug!("async queue worker stopped");
        });
        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                state: StdMutex::new(QueueState::default()),
            }),
        }
    }

    /// Schedules `op` and returns a future resolving to its result.
    ///
    /// The operation is queued immediately, before the returned future is polled,
    /// so program order equals execution order.
    pub fn enqueue<F, T>(&self, op: F) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.push_with_result(op, false);
        Self::await_result(receiver)
    }

    /// Like [`AsyncQueue::enqueue`] but accepted after shutdown began.
    pub fn enqueue_even_while_restricted<F, T>(
        &self,
        op: F,
    ) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let receiver = self.push_with_result(op, true);
        Self::await_result(receiver)
    }

    /// Schedules `op` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let task = async move {
            if let Err(err) = op.await {
                log::warn!("async queue operation failed: {err}");
            }
        }
        .boxed();
        if let Err(err) = self.push(task, false) {
            log::debug!("dropping operation: {err}");
        }
    }

    /// Schedules `op` to be enqueued once `delay` has elapsed.
    ///
    /// The returned handle can cancel the operation or run it right away.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let task: DelayedTask = Box::new(move || op().boxed());
        let entry = Arc::new(DelayedEntry {
            timer_id,
            target_time: Instant::now() + delay,
            task: StdMutex::new(Some(task)),
        });

        let id = {
            let mut state = self.lock_state();
            let id = state.next_delayed_id;
            state.next_delayed_id += 1;
            if state.restricted {
                drop(entry.take_task());
            } else {
                state.delayed.insert(id, Arc::clone(&entry));
            }
            id
        };

        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                AsyncQueue { inner }.fire_delayed(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Stops accepting new work and cancels every pending delayed operation.
    ///
    /// Work already queued still runs; use [`AsyncQueue::drain`] to wait for it.
    pub fn enter_restricted_mode(&self) {
        let entries = {
            let mut state = self.lock_state();
            state.restricted = true;
            std::mem::take(&mut state.delayed)
        };
        for entry in entries.into_values() {
            drop(entry.take_task());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().restricted
    }

    /// Resolves once everything queued before this call has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(async { Ok(()) }).await
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.lock_state()
            .delayed
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Runs pending delayed operations in target-time order, stopping after the
    /// first one registered under `last_timer_id` (or all of them for
    /// [`TimerId::All`]), then waits for them to finish.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        self.drain().await?;

        let mut ordered: Vec<(Instant, u64, TimerId)> = self
            .lock_state()
            .delayed
            .iter()
            .map(|(id, entry)| (entry.target_time, *id, entry.timer_id))
            .collect();
        ordered.sort();

        for (_, id, timer_id) in ordered {
            self.fire_delayed(id);
            if last_timer_id != TimerId::All && timer_id == last_timer_id {
                break;
            }
        }

        self.drain().await
    }

    fn fire_delayed(&self, id: u64) {
        let entry = self.lock_state().delayed.remove(&id);
        let Some(task) = entry.and_then(|entry| entry.take_task()) else {
            return;
        };
        let future = async move {
            if let Err(err) = task().await {
                log::warn!("delayed operation failed: {err}");
            }
        }
        .boxed();
        if let Err(err) = self.push(future, false) {
            log::debug!("dropping delayed operation: {err}");
        }
    }

    fn cancel_delayed(&self, id: u64) {
        let entry = self.lock_state().delayed.remove(&id);
        if let Some(entry) = entry {
            drop(entry.take_task());
        }
    }

    fn push_with_result<F, T>(
        &self,
        op: F,
        allow_restricted: bool,
    ) -> FirestoreResult<oneshot::Receiver<FirestoreResult<T>>>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let task = async move {
            let result = op.await;
            let _ = sender.send(result);
        }
        .boxed();
        self.push(task, allow_restricted)?;
        Ok(receiver)
    }

    async fn await_result<T>(
        receiver: FirestoreResult<oneshot::Receiver<FirestoreResult<T>>>,
    ) -> FirestoreResult<T> {
        receiver?
            .await
            .map_err(|_| cancelled("queued operation was dropped before completing"))?
    }

    fn push(&self, task: QueueTask, allow_restricted: bool) -> FirestoreResult<()> {
        if !allow_restricted && self.lock_state().restricted {
            return Err(cancelled("The client has already been terminated."));
        }
        self.inner
            .sender
            .try_send(task)
            .map_err(|_| cancelled("async queue worker is no longer running"))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<AsyncQueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. No-op if it already ran.
    pub fn cancel(&self) {
        if let Some(inner) = self.queue.upgrade() {
            AsyncQueue { inner }.cancel_delayed(self.id);
        }
    }

    /// Enqueues the operation now instead of waiting for its delay.
    pub fn skip_delay(&self) {
        if let Some(inner) = self.queue.upgrade() {
            AsyncQueue { inner }.fire_delayed(self.id);
        }
    }
}

impl std::fmt::Debug for AsyncQueueInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueueInner").finish_non_exhaustive()
    }
}
