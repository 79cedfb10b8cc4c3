use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use rand::Rng;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const RANDOM_FACTOR: f64 = 0.5;

/// Tuning knobs for [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetrySettings {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Base delay that follows `current` once an attempt fails.
    fn next_base(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.multiplier;
        let clamped = grown.clamp(
            self.initial_delay.as_secs_f64(),
            self.max_delay.as_secs_f64().max(self.initial_delay.as_secs_f64()),
        );
        Duration::from_secs_f64(clamped)
    }
}

/// Applies `RANDOM_FACTOR` jitter around `base`.
fn jittered_delay<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let base = base.as_secs_f64();
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    Duration::from_secs_f64((base + jitter).max(0.0))
}

/// Jittered exponential backoff scheduled on an [`AsyncQueue`].
///
/// The first attempt after a reset runs immediately. Every later attempt waits
/// `base ± 50%`, minus the time already elapsed since the previous attempt, and
/// grows the base by `multiplier` up to `max_delay`.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    settings: RetrySettings,
    current_base: Duration,
    last_attempt: Arc<StdMutex<Instant>>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId, settings: RetrySettings) -> Self {
        Self {
            queue,
            timer_id,
            settings,
            current_base: Duration::ZERO,
            last_attempt: Arc::new(StdMutex::new(Instant::now())),
            timer: None,
        }
    }

    pub fn settings(&self) -> RetrySettings {
        self.settings
    }

    /// Current base delay, before jitter.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// The next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next attempt waits the maximum delay. Used after quota errors.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    /// Schedules `op` on the queue once the current backoff delay has passed,
    /// cancelling any attempt that is still pending.
    pub fn backoff_and_run<F, Fut>(&mut self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        self.cancel();

        let desired = jittered_delay(self.current_base, &mut rand::thread_rng());
        let elapsed = self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        let remaining = desired.saturating_sub(elapsed);
        if !remaining.is_zero() {
            log::debug!(
                "backing off {:?} for {:?} (base {:?}, {:?} since last attempt)",
                self.timer_id,
                remaining,
                self.current_base,
                elapsed
            );
        }

        let last_attempt = Arc::clone(&self.last_attempt);
        self.timer = Some(self.queue.enqueue_after_delay(self.timer_id, remaining, move || {
            *last_attempt.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
            op()
        }));

        self.current_base = self.settings.next_base(self.current_base);
    }

    /// Resolves once the backoff delay has elapsed. Must not be awaited from
    /// inside a queue operation.
    pub fn backoff_and_wait(&mut self) -> impl Future<Output = FirestoreResult<()>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        self.backoff_and_run(move || async move {
            let _ = sender.send(());
            Ok(())
        });
        async move {
            receiver
                .await
                .map_err(|_| cancelled("backoff was cancelled"))
        }
    }

    /// Runs a pending attempt right away.
    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("timer_id", &self.timer_id)
            .field("current_base", &self.current_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jitter_stays_within_random_factor() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = Duration::from_secs(4);
        for _ in 0..100 {
            let value = jittered_delay(base, &mut rng);
            assert!(value >= Duration::from_secs(2));
            assert!(value <= Duration::from_secs(6));
        }
    }

    #[test]
    fn base_grows_and_caps() {
        let settings = RetrySettings::default();
        let mut base = Duration::ZERO;
        base = settings.next_base(base);
        assert_eq!(base, Duration::from_secs(1));
        base = settings.next_base(base);
        assert_eq!(base, Duration::from_millis(1500));
        for _ in 0..50 {
            base = settings.next_base(base);
        }
        assert_eq!(base, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn first_attempt_runs_immediately_and_later_ones_wait() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut backoff = ExponentialBackoff::new(
            queue.clone(),
            TimerId::ListenStreamConnectionBackoff,
            RetrySettings::default(),
        );

        backoff.backoff_and_wait().await.unwrap();
        assert_eq!(backoff.current_base(), Duration::from_secs(1));

        let task_counter = Arc::clone(&counter);
        backoff.backoff_and_run(move || async move {
            task_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));

        backoff.skip_backoff();
        queue.drain().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_drops_pending_attempt() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut backoff = ExponentialBackoff::new(
            queue.clone(),
            TimerId::WriteStreamConnectionBackoff,
            RetrySettings::default(),
        );
        backoff.reset_to_max();

        let task_counter = Arc::clone(&counter);
        backoff.backoff_and_run(move || async move {
            task_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        backoff.cancel();
        queue
            .run_delayed_operations_early(TimerId::All)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(backoff.current_base(), Duration::from_secs(60));
    }
}
