//! Two engines talking to a real docstore over WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier::config::DeliveryConfig;
use courier::remote::{RemoteError, RemoteStore, WsRemoteStore};
use courier::storage::InMemoryStorage;
use courier::DeliveryEngine;
use courier_docstore::documents::DocumentStore;
use courier_docstore::server::{self, DocstoreState};
use courier_proto::document::{DocumentId, Fields, Query};
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, SenderId};
use courier_proto::schema;

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        initial_retry_delay: Duration::from_millis(50),
        flush_interval: Duration::from_millis(100),
        visibility_dwell: Duration::from_millis(100),
        ..DeliveryConfig::default()
    }
}

async fn connect(addr: std::net::SocketAddr) -> WsRemoteStore {
    WsRemoteStore::connect(&format!("ws://{addr}/ws"), Duration::from_secs(5))
        .await
        .unwrap()
}

async fn device(addr: std::net::SocketAddr, name: &str) -> DeliveryEngine<WsRemoteStore> {
    DeliveryEngine::builder(
        Arc::new(connect(addr).await),
        Arc::new(InMemoryStorage::new()),
        SenderId::new(name),
    )
    .with_config(fast_config())
    .start()
    .unwrap()
}

#[tokio::test]
async fn message_is_read_through_the_docstore() {
    let (addr, _server) = server::start_server("127.0.0.1:0").await.unwrap();
    let alice = device(addr, "alice").await;
    let bob = device(addr, "bob").await;
    let conv = ConversationId::new();
    alice.watch_conversation(conv).await.unwrap();
    bob.watch_conversation(conv).await.unwrap();

    let mut handle = alice
        .submit(conv, MessageBody::Text("over the wire".into()))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        handle
            .status
            .wait_for(|s| s == DeliveryStatus::Delivered)
            .await
            .unwrap();
        bob.report_visibility(handle.id, 1.0);
        handle
            .status
            .wait_for(|s| s == DeliveryStatus::Read)
            .await
            .unwrap();
    })
    .await
    .expect("message was not read in time");

    let bob_copy = bob.message(&handle.id).unwrap();
    assert_eq!(bob_copy.message.status, DeliveryStatus::Read);
    assert_eq!(bob_copy.message.body, MessageBody::Text("over the wire".into()));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn quota_errors_map_to_quota_exceeded() {
    let state = Arc::new(DocstoreState::with_config(DocumentStore::new(), 1));
    let (addr, _server) = server::start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    let store = connect(addr).await;

    let mut fields = Fields::new();
    fields.insert(schema::STATUS.into(), "sent".into());
    store.create("messages", fields.clone()).await.unwrap();
    let err = store.create("messages", fields).await.unwrap_err();
    assert_eq!(err, RemoteError::QuotaExceeded);
}

#[tokio::test]
async fn missing_documents_map_to_not_found() {
    let (addr, _server) = server::start_server("127.0.0.1:0").await.unwrap();
    let store = connect(addr).await;

    let err = store
        .update("messages", &DocumentId::new("doc-77"), Fields::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
}

#[tokio::test]
async fn subscription_receives_existing_and_new_documents() {
    let (addr, _server) = server::start_server("127.0.0.1:0").await.unwrap();
    let store = connect(addr).await;

    let mut fields = Fields::new();
    fields.insert(schema::CONVERSATION_ID.into(), "c1".into());
    let first = store.create("messages", fields.clone()).await.unwrap();

    let mut feed = store
        .subscribe(Query::collection("messages").where_eq(schema::CONVERSATION_ID, "c1"))
        .await
        .unwrap();
    let second = store.create("messages", fields).await.unwrap();

    let seen: Vec<_> = tokio::time::timeout(Duration::from_secs(5), async {
        vec![
            feed.recv().await.unwrap().doc_id,
            feed.recv().await.unwrap().doc_id,
        ]
    })
    .await
    .unwrap();
    assert_eq!(seen, vec![first, second]);
}
