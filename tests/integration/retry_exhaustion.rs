//! Retry policy end to end: backoff, exhaustion, permanent rejection,
//! quota back-off, and manual retry of failed messages.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier::clock::TokioClock;
use courier::config::DeliveryConfig;
use courier::delivery::RetryError;
use courier::remote::{InMemoryRemoteStore, RemoteError};
use courier::storage::InMemoryStorage;
use courier::{DeliveryEngine, FailureReason};
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, SenderId, Timestamp};

const BASE: Timestamp = Timestamp::from_millis(1_700_000_000_000);

fn start(remote: &InMemoryRemoteStore, config: DeliveryConfig) -> DeliveryEngine<InMemoryRemoteStore> {
    DeliveryEngine::builder(
        Arc::new(remote.clone()),
        Arc::new(InMemoryStorage::new()),
        SenderId::new("alice"),
    )
    .with_config(config)
    .with_clock(Arc::new(TokioClock::starting_at(BASE)))
    .start()
    .unwrap()
}

fn network() -> RemoteError {
    RemoteError::Network("connection reset".into())
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_then_succeed() {
    let remote = InMemoryRemoteStore::new();
    remote.fail_next(network());
    remote.fail_next(network());
    let engine = start(&remote, DeliveryConfig::default());

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("eventually".into()))
        .unwrap();

    // Attempts at 0 s and 2 s fail; the third, 4 s later, lands.
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert!(remote.documents("messages").is_empty());
    assert_eq!(handle.status.current(), DeliveryStatus::Sending);
    assert_eq!(engine.message(&handle.id).unwrap().message.retry_count, 2);

    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();
    assert_eq!(remote.documents("messages").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_message() {
    let remote = InMemoryRemoteStore::new();
    for _ in 0..3 {
        remote.fail_next(network());
    }
    let config = DeliveryConfig {
        max_attempts: 3,
        ..DeliveryConfig::default()
    };
    let engine = start(&remote, config);

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("doomed".into()))
        .unwrap();
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Failed)
        .await
        .unwrap();

    let tracked = engine.message(&handle.id).unwrap();
    assert_eq!(tracked.failure, Some(FailureReason::RetriesExhausted));
    assert_eq!(tracked.message.retry_count, 3);
    assert!(engine.pending_sends().await.unwrap().is_empty());

    // Nothing else is attempted.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(remote.documents("messages").is_empty());
}

#[tokio::test(start_paused = true)]
async fn default_policy_makes_five_attempts_then_fails() {
    let remote = InMemoryRemoteStore::new();
    remote.set_offline(true);
    let engine = start(&remote, DeliveryConfig::default());

    let handle = engine
        .submit(ConversationId::new(), MessageBody::Text("unreachable".into()))
        .unwrap();

    // Attempts land at 0, 2, 6, 14 and 30 s.
    let retries = |engine: &DeliveryEngine<InMemoryRemoteStore>| {
        engine.message(&handle.id).unwrap().message.retry_count
    };
    let mut elapsed = Duration::ZERO;
    for (at_ms, expected) in [(1_000, 1), (3_000, 2), (7_000, 3), (15_000, 4), (29_900, 4)] {
        let target = Duration::from_millis(at_ms);
        tokio::time::sleep(target - elapsed).await;
        elapsed = target;
        assert_eq!(retries(&engine), expected, "at {at_ms} ms");
        assert_eq!(handle.status.current(), DeliveryStatus::Sending);
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handle.status.current(), DeliveryStatus::Failed);
    let tracked = engine.message(&handle.id).unwrap();
    assert_eq!(tracked.failure, Some(FailureReason::RetriesExhausted));
    assert_eq!(tracked.message.retry_count, 5);
    assert!(engine.pending_sends().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_retry_gets_a_fresh_budget() {
    let remote = InMemoryRemoteStore::new();
    remote.fail_next(network());
    let config = DeliveryConfig {
        max_attempts: 1,
        ..DeliveryConfig::default()
    };
    let engine = start(&remote, config);

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("again".into()))
        .unwrap();
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Failed)
        .await
        .unwrap();

    engine.retry(handle.id).unwrap();
    assert_eq!(handle.status.current(), DeliveryStatus::Sending);
    assert_eq!(engine.message(&handle.id).unwrap().message.retry_count, 0);

    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();
    assert_eq!(remote.documents("messages").len(), 1);

    assert!(matches!(
        engine.retry(handle.id),
        Err(RetryError::NotFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn rejection_fails_without_retrying() {
    let remote = InMemoryRemoteStore::new();
    remote.fail_next(RemoteError::Rejected("attachment blocked".into()));
    let engine = start(&remote, DeliveryConfig::default());

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("blocked".into()))
        .unwrap();
    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Failed)
        .await
        .unwrap();

    let tracked = engine.message(&handle.id).unwrap();
    assert!(matches!(tracked.failure, Some(FailureReason::Rejected(_))));
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(remote.documents("messages").is_empty());
}

#[tokio::test(start_paused = true)]
async fn quota_pressure_waits_at_least_the_floor() {
    let remote = InMemoryRemoteStore::new();
    remote.fail_next(RemoteError::QuotaExceeded);
    let engine = start(&remote, DeliveryConfig::default());

    let mut handle = engine
        .submit(ConversationId::new(), MessageBody::Text("busy".into()))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(remote.documents("messages").is_empty());

    handle
        .status
        .wait_for(|s| s == DeliveryStatus::Sent)
        .await
        .unwrap();
    let sent_at = engine.message(&handle.id).unwrap().message.sent_at.unwrap();
    assert!(sent_at.saturating_since(BASE) >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn unknown_and_pending_messages_cannot_be_retried() {
    let remote = InMemoryRemoteStore::new();
    remote.set_offline(true);
    let engine = start(&remote, DeliveryConfig::default());

    let handle = engine
        .submit(ConversationId::new(), MessageBody::Text("in flight".into()))
        .unwrap();
    assert!(matches!(
        engine.retry(handle.id),
        Err(RetryError::NotFailed {
            status: DeliveryStatus::Sending,
            ..
        })
    ));
    assert!(matches!(
        engine.retry(courier_proto::message::MessageId::new()),
        Err(RetryError::NotFound(_))
    ));
}
