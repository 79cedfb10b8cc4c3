#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;

use common::{data, eventually, fast_settings, key, number, start, Recorder};
use firestore_sync::firestore::core::{FirestoreClient, ListenOptions, Query};
use firestore_sync::firestore::error::{failed_precondition, FirestoreErrorCode};
use firestore_sync::firestore::local::MemoryPersistenceBackend;
use firestore_sync::firestore::model::{MutableDocument, Mutation};
use firestore_sync::firestore::remote::OnlineState;

/// Polls the local cache until a write to `path` has been applied.
async fn cached(client: &FirestoreClient, path: &str) -> MutableDocument {
    for _ in 0..400 {
        if let Ok(Some(doc)) = client.get_document_from_local_cache(&key(path)).await {
            return doc;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("{path} never reached the local cache");
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_set_is_pending_until_acknowledged() {
    let harness = start(fast_settings()).await;
    let client = harness.client.clone();
    client.disable_network().await.unwrap();
    assert_eq!(client.online_state(), OnlineState::Offline);

    let recorder = Recorder::default();
    let _registration = client
        .listen(
            Query::collection("rooms").unwrap(),
            ListenOptions::default().with_include_metadata_changes(true),
            recorder.observer(),
        )
        .unwrap();

    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/eros"), data(1))]).await });

    eventually(|| {
        recorder
            .last()
            .is_some_and(|snapshot| snapshot.docs.contains(&key("rooms/eros")) && snapshot.has_pending_writes())
    })
    .await;
    assert_eq!(harness.backend.commit_count().await, 0);

    client.enable_network().await.unwrap();
    write.await.unwrap().unwrap();

    let committed = harness.backend.document("rooms/eros").await.expect("committed on the backend");
    eventually(|| {
        recorder.last().is_some_and(|snapshot| {
            !snapshot.has_pending_writes()
                && snapshot
                    .docs
                    .get(&key("rooms/eros"))
                    .is_some_and(|doc| doc.version() == committed.version() && number(doc) == Some(1))
        })
    })
    .await;
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_fails_the_caller_and_reverts_the_view() {
    let harness = start(fast_settings()).await;
    let client = harness.client.clone();
    harness.backend.set_document("rooms/a", data(1)).await.unwrap();

    let recorder = Recorder::default();
    let _registration = client
        .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), recorder.observer())
        .unwrap();
    eventually(|| recorder.any(|snapshot| !snapshot.from_cache && snapshot.docs.len() == 1)).await;

    harness.backend.fail_next_write(failed_precondition("no")).await;
    let err = client
        .write(vec![Mutation::set(key("rooms/b"), data(2))])
        .await
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

    eventually(|| {
        recorder
            .last()
            .is_some_and(|snapshot| snapshot.docs.len() == 1 && !snapshot.docs.contains(&key("rooms/b")))
    })
    .await;
    assert!(harness.backend.document("rooms/b").await.is_none());
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_pending_writes_resolves_after_acknowledgement() {
    let harness = start(fast_settings()).await;
    let client = harness.client.clone();
    client.wait_for_pending_writes().await.unwrap();

    client.disable_network().await.unwrap();
    let writer = client.clone();
    let write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/a"), data(3))]).await });
    cached(&client, "rooms/a").await;

    let waiter = client.clone();
    let waiting = tokio::spawn(async move { waiter.wait_for_pending_writes().await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    client.enable_network().await.unwrap();
    waiting.await.unwrap().unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(harness.backend.commit_count().await, 1);
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn local_cache_reads_see_pending_writes() {
    let harness = start(fast_settings()).await;
    let client = harness.client.clone();
    client.disable_network().await.unwrap();

    let writer = client.clone();
    let _write = tokio::spawn(async move {
        writer
            .write(vec![
                Mutation::set(key("rooms/a"), data(1)),
                Mutation::delete(key("rooms/b")),
            ])
            .await
    });

    let doc = cached(&client, "rooms/a").await;
    assert!(doc.has_local_mutations());
    assert_eq!(number(&doc), Some(1));
    assert!(client.get_document_from_local_cache(&key("rooms/b")).await.unwrap().is_none());

    let snapshot = client
        .get_documents_from_local_cache(&Query::collection("rooms").unwrap())
        .await
        .unwrap();
    assert_eq!(snapshot.docs.len(), 1);
    assert!(snapshot.from_cache);
    assert!(snapshot.has_pending_writes());
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_writes_survive_a_restart() {
    let persistence = Arc::new(MemoryPersistenceBackend::new());
    let first = start(fast_settings().with_persistence(persistence.clone())).await;
    first.client.disable_network().await.unwrap();
    let writer = first.client.clone();
    let _write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("rooms/kept"), data(5))]).await });
    cached(&first.client, "rooms/kept").await;
    first.client.terminate().await.unwrap();
    assert_eq!(first.backend.commit_count().await, 0);

    let second = start(fast_settings().with_persistence(persistence)).await;
    second.client.wait_for_pending_writes().await.unwrap();
    let committed = second.backend.document("rooms/kept").await.expect("replayed after restart");
    assert_eq!(number(&committed), Some(5));
    second.client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn write_that_fails_to_persist_is_never_sent() {
    let persistence = Arc::new(MemoryPersistenceBackend::new());
    let harness = start(fast_settings().with_persistence(persistence.clone())).await;
    let client = harness.client.clone();

    persistence.set_fail_commits(true);
    let err = client
        .write(vec![Mutation::set(key("rooms/ghost"), data(1))])
        .await
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    assert!(client.get_document_from_local_cache(&key("rooms/ghost")).await.is_err());

    persistence.set_fail_commits(false);
    client.enable_network().await.unwrap();
    client.write(vec![Mutation::set(key("rooms/real"), data(2))]).await.unwrap();

    assert!(harness.backend.document("rooms/ghost").await.is_none());
    assert!(harness.backend.document("rooms/real").await.is_some());
    assert_eq!(harness.backend.commit_count().await, 1);
    client.terminate().await.unwrap();
}
