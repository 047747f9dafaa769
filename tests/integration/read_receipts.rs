//! Visibility-driven read receipts and batched status propagation, seen
//! from the receiving device.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier::clock::TokioClock;
use courier::lifecycle::AppState;
use courier::remote::InMemoryRemoteStore;
use courier::storage::InMemoryStorage;
use courier::DeliveryEngine;
use courier_proto::document::FieldValue;
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, MessageId, SenderId, Timestamp};
use courier_proto::schema;

const BASE: Timestamp = Timestamp::from_millis(1_700_000_000_000);

fn device(remote: &InMemoryRemoteStore, name: &str) -> DeliveryEngine<InMemoryRemoteStore> {
    DeliveryEngine::builder(
        Arc::new(remote.clone()),
        Arc::new(InMemoryStorage::new()),
        SenderId::new(name),
    )
    .with_clock(Arc::new(TokioClock::starting_at(BASE)))
    .start()
    .unwrap()
}

/// Alice sends `count` messages a few milliseconds apart and waits until
/// each is written. Bob has not subscribed yet.
async fn sent_messages(
    alice: &DeliveryEngine<InMemoryRemoteStore>,
    conv: ConversationId,
    count: usize,
) -> Vec<MessageId> {
    let mut ids = Vec::new();
    for n in 0..count {
        let mut handle = alice
            .submit(conv, MessageBody::Text(format!("message {n}")))
            .unwrap();
        handle
            .status
            .wait_for(|s| s == DeliveryStatus::Sent)
            .await
            .unwrap();
        ids.push(handle.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ids
}

async fn wait_until_tracked(bob: &DeliveryEngine<InMemoryRemoteStore>, id: MessageId) {
    for _ in 0..100 {
        if bob.message(&id).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("message {id} never arrived");
}

fn read_updates(remote: &InMemoryRemoteStore) -> usize {
    remote
        .updates()
        .iter()
        .filter(|(_, fields)| fields.get(schema::STATUS) == Some(&FieldValue::from("read")))
        .count()
}

#[tokio::test(start_paused = true)]
async fn brief_glance_is_not_a_read() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 1).await;
    bob.watch_conversation(conv).await.unwrap();
    wait_until_tracked(&bob, ids[0]).await;

    bob.report_visibility(ids[0], 0.6);
    tokio::time::sleep(Duration::from_millis(300)).await;
    bob.report_visibility(ids[0], 0.0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bob.message(&ids[0]).unwrap().message.status, DeliveryStatus::Delivered);
    assert_eq!(read_updates(&remote), 0);
}

#[tokio::test(start_paused = true)]
async fn steady_view_marks_read_exactly_once() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 1).await;
    bob.watch_conversation(conv).await.unwrap();
    wait_until_tracked(&bob, ids[0]).await;

    let mut events = bob.subscribe();
    for _ in 0..5 {
        bob.report_visibility(ids[0], 1.0);
        tokio::time::sleep(Duration::from_millis(400)).await;
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut reads = 0;
    while let Ok(event) = events.try_recv() {
        if event.message_id == ids[0] && event.to == DeliveryStatus::Read {
            reads += 1;
        }
    }
    assert_eq!(reads, 1);
    assert_eq!(read_updates(&remote), 1);
}

#[tokio::test(start_paused = true)]
async fn sighting_before_arrival_still_reads() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 1).await;

    // Bob's UI shows the message before his feed has delivered it.
    bob.report_visibility(ids[0], 0.9);
    tokio::time::sleep(Duration::from_millis(600)).await;
    bob.report_visibility(ids[0], 0.9);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(bob.message(&ids[0]).is_none());

    bob.watch_conversation(conv).await.unwrap();
    wait_until_tracked(&bob, ids[0]).await;
    assert_eq!(bob.message(&ids[0]).unwrap().message.status, DeliveryStatus::Delivered);

    for _ in 0..10 {
        bob.report_visibility(ids[0], 0.9);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(bob.message(&ids[0]).unwrap().message.status, DeliveryStatus::Read);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(read_updates(&remote), 1);
}

#[tokio::test(start_paused = true)]
async fn background_cancels_pending_read() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 1).await;
    bob.watch_conversation(conv).await.unwrap();
    wait_until_tracked(&bob, ids[0]).await;

    bob.report_visibility(ids[0], 1.0);
    tokio::time::sleep(Duration::from_millis(500)).await;
    bob.set_app_state(AppState::Background);
    bob.report_visibility(ids[0], 1.0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(bob.message(&ids[0]).unwrap().message.status, DeliveryStatus::Delivered);

    bob.set_app_state(AppState::Foreground);
    bob.report_visibility(ids[0], 1.0);
    let mut status = bob.observe_status(ids[0]).unwrap();
    status
        .wait_for(|s| s == DeliveryStatus::Read)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn updates_are_coalesced_and_flushed_in_batches() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 5).await;

    // Bob starts now so his flush ticks line up with the checks below.
    let bob = device(&remote, "bob");
    bob.watch_conversation(conv).await.unwrap();
    for id in &ids {
        wait_until_tracked(&bob, *id).await;
        bob.report_visibility(*id, 1.0);
    }

    // Every message is read before the first flush, so each document gets
    // one write carrying `read` instead of `delivered` then `read`.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(remote.updates().is_empty());
    assert_eq!(bob.propagator_depth(), 5);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(remote.updates().len(), 3);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(remote.updates().len(), 5);
    assert_eq!(read_updates(&remote), 5);
    assert_eq!(bob.propagator_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_pending_updates() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let conv = ConversationId::new();
    let ids = sent_messages(&alice, conv, 4).await;

    let bob = device(&remote, "bob");
    bob.watch_conversation(conv).await.unwrap();
    for id in &ids {
        wait_until_tracked(&bob, *id).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.propagator_depth(), 4);
    assert!(remote.updates().is_empty());

    bob.shutdown().await;
    assert_eq!(remote.updates().len(), 4);
}
