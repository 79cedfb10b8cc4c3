//! # firestore-sync
//!
//! An offline-first document synchronization engine modelled on the Firestore
//! client SDKs. Documents and query results are cached locally, writes are
//! applied optimistically and the cache is kept consistent with the backend
//! through resumable listen and write streams.
//!
//! The crate does not ship a transport. Callers provide a
//! [`Connection`](firestore::remote::Connection) that opens bidirectional
//! streams and runs unary calls, plus a
//! [`CredentialsProvider`](firestore::remote::CredentialsProvider). An
//! in-memory [`loopback`](firestore::remote::loopback) connection is provided
//! for tests.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use firestore_sync::firestore::core::{FirestoreClient, FirestoreSettings, ListenOptions, Query, User};
//! use firestore_sync::firestore::model::DatabaseId;
//! use firestore_sync::firestore::remote::{loopback, EmptyCredentialsProvider};
//!
//! # async fn run() -> firestore_sync::firestore::FirestoreResult<()> {
//! let (connection, _server) = loopback();
//! let client = FirestoreClient::start(
//!     DatabaseId::new("my-project", "(default)"),
//!     User::unauthenticated(),
//!     Arc::new(connection),
//!     Arc::new(EmptyCredentialsProvider),
//!     FirestoreSettings::default(),
//! )
//! .await?;
//!
//! let rooms = Query::collection("rooms")?;
//! let _registration = client.listen(rooms, ListenOptions::default(), |snapshot| {
//!     if let Ok(snapshot) = snapshot {
//!         println!("{} rooms, from cache: {}", snapshot.docs.len(), snapshot.from_cache);
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod firestore;
pub mod platform;
pub mod util;
