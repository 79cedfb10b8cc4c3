#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::time::Duration;

use common::{data, eventually, fast_settings, key, start, Recorder};
use firestore_sync::firestore::core::{ListenOptions, Query};
use firestore_sync::firestore::local::LruParams;
use firestore_sync::firestore::model::Mutation;

fn collect_everything() -> LruParams {
    LruParams {
        cache_size_collection_threshold: 0,
        ..LruParams::default()
    }
    .with_percentile(100)
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_spares_active_targets_and_pending_writes() {
    let harness = start(fast_settings().with_lru_params(collect_everything())).await;
    let client = harness.client.clone();
    harness.backend.set_document("rooms/a", data(1)).await.unwrap();
    harness.backend.set_document("archive/x", data(2)).await.unwrap();
    harness.backend.set_document("archive/y", data(3)).await.unwrap();

    let rooms = Recorder::default();
    let _rooms = client
        .listen(Query::collection("rooms").unwrap(), ListenOptions::default(), rooms.observer())
        .unwrap();
    let archive = Recorder::default();
    let archive_registration = client
        .listen(Query::collection("archive").unwrap(), ListenOptions::default(), archive.observer())
        .unwrap();
    eventually(|| rooms.any(|snapshot| !snapshot.from_cache && snapshot.docs.len() == 1)).await;
    eventually(|| archive.any(|snapshot| !snapshot.from_cache && snapshot.docs.len() == 2)).await;

    archive_registration.detach();
    for _ in 0..400 {
        if harness.backend.active_target_ids().await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.backend.active_target_ids().await.len(), 1);

    client.disable_network().await.unwrap();
    let writer = client.clone();
    let _write = tokio::spawn(async move { writer.write(vec![Mutation::set(key("archive/y"), data(30))]).await });
    for _ in 0..400 {
        if client
            .with_local_store(|store| store.has_overlay(&key("archive/y")))
            .await
            .unwrap()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let results = client.collect_garbage().await.unwrap();
    assert!(results.did_run);
    assert!(results.targets_removed >= 1);
    assert!(results.documents_removed >= 1);

    let (a, x, y) = client
        .with_local_store(|store| {
            (
                store.contains_remote_document(&key("rooms/a")),
                store.contains_remote_document(&key("archive/x")),
                store.contains_remote_document(&key("archive/y")),
            )
        })
        .await
        .unwrap();
    assert!(a, "document of an active target was collected");
    assert!(y, "document with a pending write was collected");
    assert!(!x, "orphaned document survived");
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_below_threshold_is_skipped() {
    let harness = start(fast_settings().with_lru_params(LruParams::default())).await;
    harness.backend.set_document("rooms/a", data(1)).await.unwrap();
    let results = harness.client.collect_garbage().await.unwrap();
    assert!(!results.did_run);
    harness.client.terminate().await.unwrap();
}
