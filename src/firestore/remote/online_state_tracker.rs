use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::firestore::constants::{MAX_WATCH_STREAM_FAILURES, ONLINE_STATE_TIMEOUT};
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// Unknown until the first connection attempt settles. Raised events are
    /// still marked from-cache only when offline.
    #[default]
    Unknown,
    Online,
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the [`OnlineState`] from watch stream health.
///
/// The state goes `Online` on the first watch message and `Offline` after
/// [`MAX_WATCH_STREAM_FAILURES`] failures or [`ONLINE_STATE_TIMEOUT`],
/// whichever comes first. A failure while online only drops back to
/// `Unknown`.
#[derive(Clone)]
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: Arc<Mutex<TrackerState>>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            queue,
            handler,
            state: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            })),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called whenever the watch stream (re)starts.
    pub fn handle_watch_stream_start(&self) {
        let mut state = self.lock();
        if state.watch_stream_failures != 0 {
            return;
        }
        let changed = Self::set_locked(&mut state, OnlineState::Unknown);
        if state.online_state_timer.is_none() {
            let tracker = self.clone();
            state.online_state_timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                ONLINE_STATE_TIMEOUT,
                move || async move {
                    tracker.handle_timeout();
                    Ok(())
                },
            ));
        }
        drop(state);
        self.broadcast(changed);
    }

    pub fn handle_watch_stream_failure(&self, error: &str) {
        let mut state = self.lock();
        let changed = if state.state == OnlineState::Online {
            Self::set_locked(&mut state, OnlineState::Unknown)
        } else {
            state.watch_stream_failures += 1;
            if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                Self::clear_timer(&mut state);
                Self::log_offline(
                    &mut state,
                    &format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"),
                );
                Self::set_locked(&mut state, OnlineState::Offline)
            } else {
                None
            }
        };
        drop(state);
        self.broadcast(changed);
    }

    /// Explicitly sets the state, for example `Online` once a watch message
    /// arrives or `Offline` while the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        let mut state = self.lock();
        Self::clear_timer(&mut state);
        state.watch_stream_failures = 0;
        if new_state == OnlineState::Online {
            state.should_warn_client_is_offline = false;
        }
        let changed = Self::set_locked(&mut state, new_state);
        drop(state);
        self.broadcast(changed);
    }

    fn handle_timeout(&self) {
        let mut state = self.lock();
        state.online_state_timer = None;
        let changed = if state.state == OnlineState::Unknown {
            Self::log_offline(
                &mut state,
                &format!("Backend didn't respond within {} seconds.", ONLINE_STATE_TIMEOUT.as_secs()),
            );
            Self::set_locked(&mut state, OnlineState::Offline)
        } else {
            None
        };
        drop(state);
        self.broadcast(changed);
    }

    fn set_locked(state: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
        if state.state == new_state {
            return None;
        }
        log::debug!("online state {:?} -> {new_state:?}", state.state);
        state.state = new_state;
        Some(new_state)
    }

    fn clear_timer(state: &mut TrackerState) {
        if let Some(timer) = state.online_state_timer.take() {
            timer.cancel();
        }
    }

    fn log_offline(state: &mut TrackerState, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode \
             until it is able to successfully connect."
        );
        if state.should_warn_client_is_offline {
            log::warn!("{message}");
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(new_state) = changed {
            (self.handler)(new_state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (AsyncQueue, OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
        );
        (queue, tracker, seen)
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (_queue, tracker, seen) = tracker();
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.state(), OnlineState::Unknown);
        tracker.handle_watch_stream_failure("unavailable");
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn failure_while_online_drops_to_unknown() {
        let (_queue, tracker, seen) = tracker();
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure("reset");
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Online, OnlineState::Unknown]);
    }

    #[tokio::test]
    async fn timeout_goes_offline() {
        let (queue, tracker, _seen) = tracker();
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue
            .run_delayed_operations_early(TimerId::OnlineStateTimeout)
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
    }

    #[tokio::test]
    async fn going_online_cancels_timeout() {
        let (queue, tracker, _seen) = tracker();
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.state(), OnlineState::Online);
    }
}
