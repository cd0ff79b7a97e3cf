//! Two-clone convergence scenarios over the in-memory broker

mod common;

use serde_json::json;

use common::{eventually, start_clone, start_gated, subject, DOMAIN};
use quilt_db_clone::{CloneConfig, CloneStatus};
use quilt_db_remotes::MemoryBroker;

#[tokio::test]
async fn it_genesis_election_and_join() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN)).await;
    assert_eq!(a.status(), CloneStatus::Online { genesis: true });

    let b = start_clone(&broker, CloneConfig::new("b", DOMAIN)).await;
    assert_eq!(b.status(), CloneStatus::Online { genesis: false });

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_writes_propagate_both_ways() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    let b = start_clone(&broker, CloneConfig::new("b", DOMAIN)).await;

    a.write_subject(&subject("fred", "name", json!("Fred")))
        .await
        .unwrap();
    eventually("fred at b", || async {
        b.describe("fred").await.unwrap().is_some()
    })
    .await;
    assert_eq!(
        b.describe("fred").await.unwrap().unwrap(),
        json!({ "@id": "fred", "name": "Fred" })
    );

    b.write_subject(&subject("wilma", "name", json!("Wilma")))
        .await
        .unwrap();
    eventually("wilma at a", || async {
        a.describe("wilma").await.unwrap().is_some()
    })
    .await;

    // Byte-identical state on both sides.
    let a_stats = a.stats().await.unwrap();
    let b_stats = b.stats().await.unwrap();
    assert_eq!(a_stats.quads, 2);
    assert_eq!(a_stats.quads, b_stats.quads);
    assert_eq!(a_stats.tid_mappings, b_stats.tid_mappings);
    assert_eq!(a_stats.all_tids, b_stats.all_tids);

    a.verify_journal().await.unwrap();
    b.verify_journal().await.unwrap();

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_delete_propagates() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    let b = start_clone(&broker, CloneConfig::new("b", DOMAIN)).await;

    a.write_subject(&subject("fred", "name", json!("Fred")))
        .await
        .unwrap();
    eventually("fred at b", || async {
        b.describe("fred").await.unwrap().is_some()
    })
    .await;

    a.delete_subject(&subject("fred", "name", json!("Fred")))
        .await
        .unwrap();
    eventually("fred gone at b", || async {
        b.describe("fred").await.unwrap().is_none()
    })
    .await;
    // No dangling TID mappings anywhere.
    assert_eq!(b.stats().await.unwrap().tid_mappings, 0);
    assert_eq!(a.stats().await.unwrap().tid_mappings, 0);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_concurrent_blank_nodes_do_not_collide() {
    let broker = MemoryBroker::new();
    let (a, a_gate) = start_gated(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    let (b, b_gate) = start_gated(&broker, CloneConfig::new("b", DOMAIN)).await;

    // Genuinely concurrent anonymous inserts: neither delta crosses until
    // both writes committed.
    a_gate.hold();
    b_gate.hold();
    a.write_subject(&json!({ "name": "Anon" })).await.unwrap();
    b.write_subject(&json!({ "name": "Anon" })).await.unwrap();
    a_gate.release().await;
    b_gate.release().await;

    // Both anonymous subjects survive on both clones: distinct blank ids.
    eventually("two subjects at a", || async {
        a.stats().await.unwrap().quads == 2
    })
    .await;
    eventually("two subjects at b", || async {
        b.stats().await.unwrap().quads == 2
    })
    .await;

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn it_closed_clone_rejects_operations() {
    let broker = MemoryBroker::new();
    let a = start_clone(&broker, CloneConfig::new("a", DOMAIN).with_genesis()).await;
    a.close().await;
    assert_eq!(a.status(), CloneStatus::Closed);
    assert!(a
        .write_subject(&subject("fred", "name", json!("Fred")))
        .await
        .is_err());
    // Idempotent.
    a.close().await;
}
