use std::sync::{Arc, Mutex, PoisonError};

/// Reachability reported by the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

pub type ConnectivityCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Source of network reachability changes.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    fn add_callback(&self, callback: ConnectivityCallback);

    fn shutdown(&self);
}

/// Monitor for platforms without reachability signals. Never fires.
#[derive(Default, Debug)]
pub struct NoopConnectivityMonitor;

impl ConnectivityMonitor for NoopConnectivityMonitor {
    fn add_callback(&self, _callback: ConnectivityCallback) {}

    fn shutdown(&self) {}
}

/// Monitor driven by the embedder, for example from an OS reachability hook.
#[derive(Default)]
pub struct ManualConnectivityMonitor {
    callbacks: Mutex<Vec<ConnectivityCallback>>,
}

impl ManualConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: NetworkStatus) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(status);
        }
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn add_callback(&self, callback: ConnectivityCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn shutdown(&self) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
