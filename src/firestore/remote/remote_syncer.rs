use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::core::user::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Bridge from the remote store back into the sync engine.
///
/// Every call happens on the async queue with no remote store lock held, so
/// implementations may call back into the remote store.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot assembled from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected a listen target.
    fn reject_listen(&self, target_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend committed a batch.
    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected a batch.
    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the local store associates with a target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// First pending batch with an id above `after_batch_id`.
    fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    /// Snapshot version of the last remote event applied locally.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn apply_online_state_change(&self, online_state: OnlineState);

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        let _ = user;
        box_remote_store_future(async { Ok(()) })
    }
}
