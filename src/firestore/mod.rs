//! Offline-first document synchronization: a local cache of documents and
//! queries kept consistent with the backend over resumable streams.

pub mod constants;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
#[doc(hidden)]
pub mod test_support;
pub mod value;

pub use self::core::{FirestoreClient, FirestoreSettings, ListenOptions, ListenerRegistration, Query, TransactionOptions};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
