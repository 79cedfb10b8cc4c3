#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync::firestore::core::{FirestoreClient, FirestoreSettings, User, ViewSnapshot};
use firestore_sync::firestore::local::LruParams;
use firestore_sync::firestore::model::{DatabaseId, DocumentKey, FieldPath, MutableDocument};
use firestore_sync::firestore::remote::{loopback, EmptyCredentialsProvider};
use firestore_sync::firestore::test_support::FakeBackend;
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::FirestoreResult;
use firestore_sync::util::RetrySettings;

pub struct Harness {
    pub client: FirestoreClient,
    pub backend: FakeBackend,
}

pub fn fast_settings() -> FirestoreSettings {
    FirestoreSettings::default()
        .with_lru_params(LruParams::disabled())
        .with_retry(
            RetrySettings::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100)),
        )
}

pub async fn start(settings: FirestoreSettings) -> Harness {
    let database_id = DatabaseId::new("sync-tests", "(default)");
    let (connection, server) = loopback();
    let backend = FakeBackend::start(server, database_id.clone());
    let client = FirestoreClient::start(
        database_id,
        User::unauthenticated(),
        Arc::new(connection),
        Arc::new(EmptyCredentialsProvider),
        settings,
    )
    .await
    .expect("start client");
    Harness { client, backend }
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn data(n: i64) -> MapValue {
    let mut map = MapValue::empty();
    map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
    map
}

pub fn number(doc: &MutableDocument) -> Option<i64> {
    doc.field(&FieldPath::from_dot_separated("n").unwrap())
        .and_then(FirestoreValue::as_integer)
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Collects everything a listener observes.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>,
}

impl Recorder {
    pub fn observer(&self) -> impl Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| events.lock().unwrap().push(event)
    }

    pub fn snapshots(&self) -> Vec<ViewSnapshot> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| event.as_ref().ok().cloned())
            .collect()
    }

    pub fn last(&self) -> Option<ViewSnapshot> {
        self.snapshots().pop()
    }

    pub fn errors(&self) -> Vec<firestore_sync::firestore::FirestoreError> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| event.as_ref().err().cloned())
            .collect()
    }

    pub fn any(&self, predicate: impl Fn(&ViewSnapshot) -> bool) -> bool {
        self.snapshots().iter().any(predicate)
    }
}
