//! Bootstrap scenarios: snapshot, rev-up, duplicate suppression, locking

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{eventually, start_clone, subject, DOMAIN};
use quilt_db_clone::{CloneConfig, CloneEngine, CloneError};
use quilt_db_core::MemoryKvStore;
use quilt_db_remotes::{MemoryBroker, MemoryTransport, OperationEnvelope, PubSubTransport};

async fn start_on_store(
    broker: &MemoryBroker,
    config: CloneConfig,
    store: MemoryKvStore,
) -> quilt_db_clone::Result<CloneEngine> {
    let client = broker.client(config.id.clone());
    CloneEngine::start(config, Arc::new(store), Arc::new(client), None).await
}

#[tokio::test]
async fn it_snapshot_bootstrap_carries_state() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    for (id, name) in [("fred", "Fred"), ("wilma", "Wilma"), ("pebbles", "Pebbles")] {
        a.write_subject(&subject(id, "name", json!(name))).await.unwrap();
    }

    // A fresh clone on an existing domain adopts a snapshot.
    let b = start_clone(&broker, CloneConfig::new("b", DOMAIN)).await;
    for id in ["fred", "wilma", "pebbles"] {
        assert!(b.describe(id).await.unwrap().is_some(), "{} missing", id);
    }
    let a_stats = a.stats().await.unwrap();
    let b_stats = b.stats().await.unwrap();
    assert_eq!(a_stats.quads, b_stats.quads);
    assert_eq!(a_stats.tid_mappings, b_stats.tid_mappings);
    assert_eq!(a_stats.all_tids, b_stats.all_tids);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_revup_after_restart() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;

    // B joins, learns its causal point, and goes offline.
    let b_store = MemoryKvStore::new();
    let b = start_on_store(&broker, CloneConfig::new("b", DOMAIN), b_store.clone())
        .await
        .unwrap();
    b.close().await;

    // A commits five writes while B is away.
    for n in 0..5 {
        a.write_subject(&subject(&format!("s{}", n), "name", json!(format!("v{}", n))))
            .await
            .unwrap();
    }

    // B restarts on its persisted store and catches up by rev-up.
    let b = start_on_store(&broker, CloneConfig::new("b", DOMAIN), b_store.reopen())
        .await
        .unwrap();
    eventually("b caught up", || async {
        b.stats().await.unwrap().quads == 5
    })
    .await;
    for n in 0..5 {
        assert_eq!(
            b.describe(&format!("s{}", n)).await.unwrap().unwrap()["name"],
            json!(format!("v{}", n))
        );
    }
    // Five missed deltas on top of the reset tail entry.
    assert_eq!(b.stats().await.unwrap().journal_entries, 6);
    b.verify_journal().await.unwrap();

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_duplicate_redelivery_is_a_no_op() {
    let broker = MemoryBroker::new();

    // A spy captures the raw operation envelope for later redelivery.
    let spy: MemoryTransport = broker.client("spy");
    let mut captured = spy.subscribe(&format!("{}/operations", DOMAIN)).await.unwrap();

    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    let b = start_clone(&broker, CloneConfig::new("b", DOMAIN)).await;
    let mut b_updates = b.updates();

    a.write_subject(&subject("fred", "name", json!("Fred")))
        .await
        .unwrap();
    eventually("fred at b", || async {
        b.describe("fred").await.unwrap().is_some()
    })
    .await;
    let journal_before = b.stats().await.unwrap().journal_entries;
    let update = b_updates.recv().await.unwrap();
    assert!(!update.is_empty());

    // The broker redelivers the same delta (at-least-once QoS).
    let raw = captured.recv().await.unwrap();
    let envelope: OperationEnvelope = serde_json::from_slice(&raw.payload).unwrap();
    assert_eq!(envelope.from, "a");
    spy.publish(&raw.topic, raw.payload.clone(), false)
        .await
        .unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // Second application is a no-op: no journal entry, no notification.
    assert_eq!(b.stats().await.unwrap().journal_entries, journal_before);
    assert!(matches!(
        b_updates.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_restart_alone_continues_from_local_state() {
    let broker = MemoryBroker::new();
    let store = MemoryKvStore::new();
    let a = start_on_store(
        &broker,
        CloneConfig::new("a", DOMAIN).with_genesis(),
        store.clone(),
    )
    .await
    .unwrap();
    a.write_subject(&subject("fred", "name", json!("Fred")))
        .await
        .unwrap();
    a.close().await;

    // Nobody else in the domain: the restart proceeds from local state.
    let a = start_on_store(
        &broker,
        CloneConfig::new("a", DOMAIN).with_send_timeout(50),
        store.reopen(),
    )
    .await
    .unwrap();
    assert!(a.describe("fred").await.unwrap().is_some());
    a.close().await;
}

#[tokio::test]
async fn it_storage_lock_is_exclusive() {
    let broker = MemoryBroker::new();
    let dir = tempfile::tempdir().unwrap();

    let a = CloneEngine::start(
        CloneConfig::new("a", DOMAIN).with_genesis(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(broker.client("a")),
        Some(dir.path()),
    )
    .await
    .unwrap();

    let contender = CloneEngine::start(
        CloneConfig::new("a2", DOMAIN),
        Arc::new(MemoryKvStore::new()),
        Arc::new(broker.client("a2")),
        Some(dir.path()),
    )
    .await;
    assert!(matches!(
        contender,
        Err(CloneError::Core(quilt_db_core::Error::StorageLocked(_)))
    ));

    // Release on close frees the directory for a successor.
    a.close().await;
    let successor = CloneEngine::start(
        CloneConfig::new("a3", DOMAIN).with_genesis(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(broker.client("a3")),
        Some(dir.path()),
    )
    .await;
    assert!(successor.is_ok());
    successor.unwrap().close().await;
}
