use std::future::Future;
use std::time::Duration;

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when one is entered and falls back to a shared
/// background runtime otherwise, so the sync engine can be driven from plain
/// synchronous callers as well.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
        match Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-sync-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::warn!("failed to build background tokio runtime: {err}");
                None
            }
        }
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    tokio::time::sleep(duration).await;
}
