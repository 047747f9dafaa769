//! End-to-end delivery between two devices sharing one document store.
//!
//! Alice sends, Bob's device picks the message up through its conversation
//! subscription (delivered), Bob looks at it (read), and Alice's copy follows
//! each step through her own subscription.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier::clock::TokioClock;
use courier::remote::InMemoryRemoteStore;
use courier::storage::InMemoryStorage;
use courier::{DeliveryEngine, Direction, StatusChanged};
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, MessageId, SenderId, Timestamp};
use courier_proto::schema;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

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

fn text(s: &str) -> MessageBody {
    MessageBody::Text(s.to_string())
}

/// Waits until `id` reaches `status` on the broadcast, returning the event.
async fn wait_for_change(
    events: &mut broadcast::Receiver<StatusChanged>,
    id: MessageId,
    status: DeliveryStatus,
) -> StatusChanged {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.message_id == id && event.to == status {
                return event;
            }
        }
    })
    .await
    .expect("status change never arrived")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn message_moves_from_sending_to_read() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    alice.watch_conversation(conv).await.unwrap();
    bob.watch_conversation(conv).await.unwrap();

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    let mut handle = alice.submit(conv, text("hello bob")).unwrap();
    assert_eq!(handle.status.current(), DeliveryStatus::Sending);

    // Bob's device receives it: delivered on both sides.
    let arrived = wait_for_change(&mut bob_events, handle.id, DeliveryStatus::Delivered).await;
    assert_eq!(arrived.direction, Direction::Inbound);
    assert_eq!(arrived.from, None);
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Delivered)
        .await
        .unwrap();

    // Bob looks at it long enough.
    bob.report_visibility(handle.id, 1.0);
    let status = handle.status.wait_for(|s| s == DeliveryStatus::Read).await;
    assert_eq!(status, Some(DeliveryStatus::Read));

    let mut sequence = Vec::new();
    while let Ok(event) = alice_events.try_recv() {
        if event.message_id == handle.id {
            sequence.push(event.to);
        }
    }
    assert_eq!(
        sequence,
        vec![
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
        ]
    );

    let tracked = alice.message(&handle.id).unwrap().message;
    let sent = tracked.sent_at.unwrap();
    let delivered = tracked.delivered_at.unwrap();
    let read = tracked.read_at.unwrap();
    assert!(tracked.created_at <= sent && sent <= delivered && delivered <= read);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn document_records_the_counterparts_status() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    bob.watch_conversation(conv).await.unwrap();

    let mut bob_events = bob.subscribe();
    let handle = alice.submit(conv, text("ping")).unwrap();
    wait_for_change(&mut bob_events, handle.id, DeliveryStatus::Delivered).await;
    bob.report_visibility(handle.id, 0.9);
    wait_for_change(&mut bob_events, handle.id, DeliveryStatus::Read).await;

    // Let Bob's propagator flush.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let docs = remote.documents("messages");
    assert_eq!(docs.len(), 1);
    let record = schema::parse_message(&docs[0].1).unwrap();
    assert_eq!(record.local_id, handle.id);
    assert_eq!(record.status, DeliveryStatus::Read);
    assert!(record.read_at.is_some());

    // Alice never subscribed, so her copy stays at sent.
    assert_eq!(alice.message(&handle.id).unwrap().message.status, DeliveryStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn own_messages_are_never_marked_read_locally() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let conv = ConversationId::new();
    alice.watch_conversation(conv).await.unwrap();

    let mut handle = alice.submit(conv, text("note to self")).unwrap();
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();

    alice.report_visibility(handle.id, 1.0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.status.current(), DeliveryStatus::Sent);
    assert!(remote.updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn conversation_lists_both_directions_in_order() {
    let remote = InMemoryRemoteStore::new();
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    alice.watch_conversation(conv).await.unwrap();
    bob.watch_conversation(conv).await.unwrap();

    let mut bob_events = bob.subscribe();
    let first = alice.submit(conv, text("hi")).unwrap();
    wait_for_change(&mut bob_events, first.id, DeliveryStatus::Delivered).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut reply = bob.submit(conv, text("hey")).unwrap();
    reply
        .status
        .wait_for(|s| s == DeliveryStatus::Delivered)
        .await
        .unwrap();

    let ids: Vec<_> = alice
        .conversation(&conv)
        .into_iter()
        .map(|t| (t.message.id, t.direction))
        .collect();
    assert_eq!(
        ids,
        vec![(first.id, Direction::Outbound), (reply.id, Direction::Inbound)]
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_change_events_are_harmless() {
    let remote = InMemoryRemoteStore::new();
    remote.set_duplicate_events(true);
    let alice = device(&remote, "alice");
    let bob = device(&remote, "bob");
    let conv = ConversationId::new();
    alice.watch_conversation(conv).await.unwrap();
    bob.watch_conversation(conv).await.unwrap();

    let mut bob_events = bob.subscribe();
    let mut handle = alice.submit(conv, text("twice?")).unwrap();
    wait_for_change(&mut bob_events, handle.id, DeliveryStatus::Delivered).await;
    bob.report_visibility(handle.id, 1.0);
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Read)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(remote.documents("messages").len(), 1);
    let mut statuses = Vec::new();
    while let Ok(event) = bob_events.try_recv() {
        if event.message_id == handle.id {
            statuses.push(event.to);
        }
    }
    // Delivered was consumed above; only one read follows.
    assert_eq!(statuses, vec![DeliveryStatus::Read]);
}
