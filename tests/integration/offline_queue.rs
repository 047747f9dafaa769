//! Offline queue behaviour: messages written while offline wait for
//! connectivity, survive a restart, and are written exactly once.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier::clock::TokioClock;
use courier::connectivity::{ConnectionQuality, ConnectivityMonitor, LinkReport};
use courier::lifecycle::{AppState, LifecycleSignal};
use courier::remote::InMemoryRemoteStore;
use courier::storage::{InMemoryStorage, LocalStorage};
use courier::DeliveryEngine;
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, SenderId, Timestamp};

const BASE: Timestamp = Timestamp::from_millis(1_700_000_000_000);

const WIFI: LinkReport = LinkReport {
    ethernet: false,
    wifi: true,
    cellular: false,
};

fn start(
    remote: &InMemoryRemoteStore,
    storage: &InMemoryStorage,
    connectivity: ConnectivityMonitor,
) -> DeliveryEngine<InMemoryRemoteStore> {
    DeliveryEngine::builder(
        Arc::new(remote.clone()),
        Arc::new(storage.clone()),
        SenderId::new("alice"),
    )
    .with_clock(Arc::new(TokioClock::starting_at(BASE)))
    .with_connectivity(connectivity)
    .start()
    .unwrap()
}

fn offline_monitor() -> ConnectivityMonitor {
    let monitor = ConnectivityMonitor::new();
    monitor.report(LinkReport::offline());
    monitor
}

#[tokio::test(start_paused = true)]
async fn messages_wait_for_connectivity() {
    let remote = InMemoryRemoteStore::new();
    let engine = start(&remote, &InMemoryStorage::new(), offline_monitor());
    let conv = ConversationId::new();

    let handles: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|t| engine.submit(conv, MessageBody::Text((*t).to_string())).unwrap())
        .collect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(remote.documents("messages").is_empty());
    assert_eq!(engine.pending_ids().len(), 3);
    for handle in &handles {
        assert_eq!(handle.status.current(), DeliveryStatus::Sending);
    }

    assert_eq!(engine.report_link(WIFI), ConnectionQuality::Good);
    for handle in &handles {
        let mut status = handle.status.clone();
        status
            .wait_for(|s| s == DeliveryStatus::Sent)
            .await
            .unwrap();
    }
    assert_eq!(remote.documents("messages").len(), 3);
    assert!(engine.pending_sends().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn queue_survives_restart_and_writes_once() {
    let remote = InMemoryRemoteStore::new();
    let storage = InMemoryStorage::new();
    let conv = ConversationId::new();

    let engine = start(&remote, &storage, offline_monitor());
    let first = engine.submit(conv, MessageBody::Text("before".into())).unwrap();
    let second = engine.submit(conv, MessageBody::Text("restart".into())).unwrap();
    engine.shutdown().await;
    assert!(!storage.is_empty());

    // A new process over the same storage, online this time.
    let engine = start(&remote, &storage, ConnectivityMonitor::new());
    for id in [first.id, second.id] {
        let mut status = engine.observe_status(id).unwrap();
        status
            .wait_for(|s| s == DeliveryStatus::Sent)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    let docs = remote.documents("messages");
    assert_eq!(docs.len(), 2);
    assert!(engine.pending_sends().await.unwrap().is_empty());

    engine.shutdown().await;
    assert!(storage.read("outbox").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn restored_entries_keep_their_attempt_count() {
    let remote = InMemoryRemoteStore::new();
    let storage = InMemoryStorage::new();
    remote.set_offline(true);

    let engine = start(&remote, &storage, ConnectivityMonitor::new());
    let handle = engine
        .submit(ConversationId::new(), MessageBody::Text("flaky".into()))
        .unwrap();
    // First attempt fails at once, the retry is 2 s later.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let pending = engine.pending_sends().await.unwrap();
    assert_eq!(pending.len(), 1);
    let attempts = pending[0].attempts;
    assert!(attempts >= 1);
    engine.shutdown().await;

    let engine = start(&remote, &storage, offline_monitor());
    let restored = engine.pending_sends().await.unwrap();
    assert_eq!(*restored[0].id(), handle.id);
    assert_eq!(restored[0].attempts, attempts);
    assert_eq!(
        engine.message(&handle.id).unwrap().message.retry_count,
        attempts
    );
}

#[tokio::test(start_paused = true)]
async fn background_defers_dispatch_until_foreground() {
    let remote = InMemoryRemoteStore::new();
    let lifecycle = LifecycleSignal::new(AppState::Background);
    let engine = DeliveryEngine::builder(
        Arc::new(remote.clone()),
        Arc::new(InMemoryStorage::new()),
        SenderId::new("alice"),
    )
    .with_clock(Arc::new(TokioClock::starting_at(BASE)))
    .with_lifecycle(lifecycle.clone())
    .start()
    .unwrap();

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("later".into()))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(remote.documents("messages").is_empty());

    engine.set_app_state(AppState::Foreground);
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();
    assert_eq!(remote.documents("messages").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_does_not_block_sending() {
    let remote = InMemoryRemoteStore::new();
    let storage = InMemoryStorage::new();
    storage.set_fail_writes(true);
    let engine = start(&remote, &storage, ConnectivityMonitor::new());

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("no disk".into()))
        .unwrap();
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();
    assert!(engine.flush_outbox().await.is_ok());
}
