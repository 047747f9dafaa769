//! Property-based tests for the persisted outbox and the document-store
//! wire frames.
//!
//! Uses proptest to verify:
//! 1. Any outbox survives encode → decode with order and content intact.
//! 2. Random bytes never cause a panic in any decoder.
//! 3. Any client frame survives the wire.
//! 4. The status transition table only ever moves forward on the main path.

use proptest::prelude::*;
use courier_proto::codec;
use courier_proto::delivery::PendingSend;
use courier_proto::docstore::{self, ClientFrame};
use courier_proto::document::{DocumentId, FieldValue, Fields, Query};
use courier_proto::message::*;
use uuid::Uuid;

// --- Strategies ---

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_conversation_id() -> impl Strategy<Value = ConversationId> {
    any::<u128>().prop_map(|n| ConversationId::from_uuid(Uuid::from_u128(n)))
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    any::<u64>().prop_map(Timestamp::from_millis)
}

fn arb_status() -> impl Strategy<Value = DeliveryStatus> {
    prop_oneof![
        Just(DeliveryStatus::Sending),
        Just(DeliveryStatus::Sent),
        Just(DeliveryStatus::Delivered),
        Just(DeliveryStatus::Read),
        Just(DeliveryStatus::Failed),
    ]
}

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        "[^\x00]{1,512}".prop_map(MessageBody::Text),
        ("[a-z]{1,8}/[a-z]{1,8}", "https://[a-z]{1,16}\\.example/[a-z0-9]{1,16}", any::<u64>())
            .prop_map(|(mime, url, size_bytes)| MessageBody::Media(MediaRef {
                mime,
                url,
                size_bytes,
            })),
    ]
}

fn arb_pending() -> impl Strategy<Value = PendingSend> {
    (
        arb_message_id(),
        arb_conversation_id(),
        "[a-z]{1,16}",
        arb_body(),
        arb_timestamp(),
        0u32..16,
        arb_timestamp(),
        proptest::option::of("[a-zA-Z0-9]{4,20}"),
    )
        .prop_map(
            |(id, conversation, sender, body, created_at, attempts, next_retry_at, remote)| {
                let mut message =
                    Message::new(id, conversation, SenderId::new(sender), body, created_at);
                message.remote_id = remote.map(DocumentId::new);
                message.retry_count = attempts;
                PendingSend {
                    message,
                    attempts,
                    next_retry_at,
                    queued_at: created_at,
                }
            },
        )
}

fn arb_field_value() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Int),
        ".{0,64}".prop_map(FieldValue::Text),
        arb_timestamp().prop_map(FieldValue::Timestamp),
    ]
}

fn arb_fields() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map("[a-z_]{1,12}", arb_field_value(), 0..8)
}

fn arb_client_frame() -> impl Strategy<Value = ClientFrame> {
    prop_oneof![
        (any::<u64>(), "[a-z]{1,12}", arb_fields()).prop_map(|(request_id, collection, fields)| {
            ClientFrame::Create {
                request_id,
                collection,
                fields,
            }
        }),
        (any::<u64>(), "[a-z]{1,12}", "[a-z0-9]{1,20}", arb_fields()).prop_map(
            |(request_id, collection, doc_id, fields)| ClientFrame::Update {
                request_id,
                collection,
                doc_id: DocumentId::new(doc_id),
                fields,
            }
        ),
        (any::<u64>(), "[a-z]{1,12}", "[a-z_]{1,12}", arb_field_value()).prop_map(
            |(request_id, collection, field, value)| ClientFrame::Subscribe {
                request_id,
                query: Query::collection(collection).where_eq(field, value),
            }
        ),
        any::<u64>().prop_map(|subscription_id| ClientFrame::Unsubscribe { subscription_id }),
    ]
}

// --- Property tests ---

proptest! {
    /// Any outbox decodes back to the same entries in the same order.
    #[test]
    fn outbox_round_trip(entries in prop::collection::vec(arb_pending(), 0..12)) {
        let bytes = codec::encode_outbox(&entries).expect("encode should succeed");
        let decoded = codec::decode_outbox(&bytes).expect("decode should succeed");
        prop_assert_eq!(decoded.corrupt, 0);
        prop_assert_eq!(decoded.entries, entries);
    }

    /// Random bytes never cause a panic when decoded as an outbox.
    #[test]
    fn random_bytes_decode_outbox_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_outbox(&bytes);
    }

    /// Random bytes never cause a panic when decoded as wire frames.
    #[test]
    fn random_bytes_decode_frames_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = docstore::decode_client(&bytes);
        let _ = docstore::decode_server(&bytes);
    }

    /// Any client frame survives the wire.
    #[test]
    fn client_frame_round_trip(frame in arb_client_frame()) {
        let bytes = docstore::encode_client(&frame).expect("encode should succeed");
        let decoded = docstore::decode_client(&bytes).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Every permitted transition between forward-path states moves forward.
    #[test]
    fn permitted_forward_transitions_advance(from in arb_status(), to in arb_status()) {
        let on_main_path = from != DeliveryStatus::Failed && to != DeliveryStatus::Failed;
        if on_main_path && from.can_transition_to(to) {
            prop_assert!(to.is_ahead_of(from));
        }
    }

    /// Nothing leaves `Read`, and `Failed` only returns to `Sending`.
    #[test]
    fn terminal_states_are_closed(to in arb_status()) {
        prop_assert!(!DeliveryStatus::Read.can_transition_to(to));
        prop_assert_eq!(
            DeliveryStatus::Failed.can_transition_to(to),
            to == DeliveryStatus::Sending
        );
    }
}
