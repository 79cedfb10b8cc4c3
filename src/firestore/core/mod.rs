//! Query views, the sync engine and the client that ties the local and
//! remote halves together.

pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod settings;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod user;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use document_set::DocumentSet;
#[doc(inline)]
pub use event_manager::{EventManager, QueryListener, QueryObserver};
#[doc(inline)]
pub use firestore_client::{FirestoreClient, ListenerRegistration};
#[doc(inline)]
pub use query::{LimitType, Query};
#[doc(inline)]
pub use settings::{FirestoreSettings, ListenOptions, ListenSource, TransactionOptions};
#[doc(inline)]
pub use sync_engine::{SyncEngine, SyncEngineListener};
#[doc(inline)]
pub use target::Target;
#[doc(inline)]
pub use transaction::{Transaction, TransactionRunner};
#[doc(inline)]
pub use user::User;
#[doc(inline)]
pub use view_snapshot::{ChangeType, DocumentViewChange, ViewSnapshot};
