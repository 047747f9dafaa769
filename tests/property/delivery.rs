//! Property-based tests for the delivery engine's pure parts.
//!
//! Uses proptest to verify:
//! 1. Backoff delays never exceed the cap, never shrink, and respect the
//!    quota floor.
//! 2. The update queue coalesces per message, only ever writes a
//!    message's highest status last, and forgets messages once read.
//! 3. Any event sequence moves a message along permitted transitions only,
//!    with ordered timestamps.

use std::collections::HashSet;
use std::time::Duration;

use courier::delivery::{DeliveryEvent, StateMachine};
use courier::error::DeliveryError;
use courier::propagator::UpdateQueue;
use courier::queue::BackoffPolicy;
use courier_proto::delivery::{Priority, StatusUpdate};
use courier_proto::document::DocumentId;
use courier_proto::message::*;
use proptest::prelude::*;

// --- Strategies ---

fn arb_policy() -> impl Strategy<Value = BackoffPolicy> {
    (1u64..10_000, 1u64..1_000, 1u32..10, 0u64..120).prop_map(
        |(initial_ms, extra_ms, max_attempts, floor_s)| BackoffPolicy {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(initial_ms * extra_ms),
            max_attempts,
            quota_floor: Duration::from_secs(floor_s),
        },
    )
}

fn arb_target() -> impl Strategy<Value = DeliveryStatus> {
    prop_oneof![Just(DeliveryStatus::Delivered), Just(DeliveryStatus::Read)]
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Normal), Just(Priority::High)]
}

fn arb_event() -> impl Strategy<Value = DeliveryEvent> {
    prop_oneof![
        (0u32..100).prop_map(|n| DeliveryEvent::Acked {
            remote_id: DocumentId::new(format!("doc-{n}"))
        }),
        (1u32..10).prop_map(|attempts| DeliveryEvent::AttemptFailed { attempts }),
        (1u32..10).prop_map(|attempts| DeliveryEvent::Exhausted { attempts }),
        "[a-z]{1,8}".prop_map(|reason| DeliveryEvent::Rejected { reason }),
        Just(DeliveryEvent::StaleTimeout),
        Just(DeliveryEvent::Seen),
    ]
}

fn update(id: MessageId, target: DeliveryStatus, priority: Priority, at: u64) -> StatusUpdate {
    StatusUpdate {
        message_id: id,
        remote_id: DocumentId::new(format!("doc-{id}")),
        target,
        priority,
        enqueued_at: Timestamp::from_millis(at),
        changed_at: Timestamp::from_millis(at),
    }
}

// --- Properties ---

proptest! {
    #[test]
    fn backoff_is_capped_and_monotonic(policy in arb_policy(), n in 0u32..64) {
        let delay = policy.delay_for(n);
        prop_assert!(delay <= policy.max);
        prop_assert!(delay >= policy.initial.min(policy.max));
        prop_assert!(policy.delay_for(n + 1) >= delay);
    }

    #[test]
    fn quota_backoff_respects_the_floor(policy in arb_policy(), n in 0u32..64) {
        let quota = policy.delay_after(n, &DeliveryError::QuotaExceeded);
        prop_assert!(quota >= policy.quota_floor);
        prop_assert!(quota >= policy.delay_for(n));

        let network = policy.delay_after(n, &DeliveryError::TransientNetwork("reset".into()));
        prop_assert_eq!(network, policy.delay_for(n));
    }

    #[test]
    fn update_queue_writes_highest_status_last(
        pushes in proptest::collection::vec((0usize..4, arb_target(), arb_priority()), 1..40),
        batch in 1usize..5,
    ) {
        let ids: Vec<_> = (0..4).map(|_| MessageId::new()).collect();
        let mut queue = UpdateQueue::new();
        for (at, (idx, target, priority)) in pushes.iter().enumerate() {
            queue.push(update(ids[*idx], *target, *priority, at as u64));
        }

        let touched: HashSet<_> = pushes.iter().map(|(idx, ..)| ids[*idx]).collect();
        prop_assert_eq!(queue.len(), touched.len());

        let mut written = Vec::new();
        while !queue.is_empty() {
            let popped = queue.pop_batch(batch);
            prop_assert!(!popped.is_empty());
            prop_assert!(popped.len() <= batch);
            let unique: HashSet<_> = popped.iter().map(|u| u.message_id).collect();
            prop_assert_eq!(unique.len(), popped.len());
            for u in popped {
                written.push((u.message_id, u.target));
                queue.complete(u, &Ok(()));
            }
        }

        // One write per message, carrying the most advanced status pushed.
        prop_assert_eq!(written.len(), touched.len());
        let mut delivered_only = 0;
        for (id, target) in written {
            let highest = pushes
                .iter()
                .filter(|(idx, ..)| ids[*idx] == id)
                .map(|(_, t, _)| *t)
                .fold(DeliveryStatus::Delivered, |acc, t| if t.is_ahead_of(acc) { t } else { acc });
            prop_assert_eq!(target, highest);

            // A written `delivered` refuses repeats; a written `read` is forgotten.
            if target == DeliveryStatus::Delivered {
                delivered_only += 1;
                prop_assert!(!queue.push(update(id, DeliveryStatus::Delivered, Priority::High, 0)));
                prop_assert!(queue.get(&id).is_none());
            }
        }
        prop_assert_eq!(queue.written_len(), delivered_only);
    }

    #[test]
    fn events_follow_permitted_transitions(events in proptest::collection::vec(arb_event(), 0..30)) {
        let mut sm = StateMachine::new(SenderId::new("alice"));
        let (id, _) = sm
            .submit(ConversationId::new(), MessageBody::Text("hi".into()), Timestamp::from_millis(1_000))
            .unwrap();

        for (step, event) in events.into_iter().enumerate() {
            let before = sm.status(&id).unwrap();
            let now = Timestamp::from_millis(2_000 + step as u64 * 10);
            sm.apply(id, event, now).unwrap();
            let after = sm.status(&id).unwrap();
            prop_assert!(before == after || before.can_transition_to(after),
                "{} -> {} is not permitted", before, after);

            let m = &sm.get(&id).unwrap().message;
            if let (Some(sent), Some(delivered)) = (m.sent_at, m.delivered_at) {
                prop_assert!(sent <= delivered);
            }
            if let Some(sent) = m.sent_at {
                prop_assert!(m.created_at <= sent);
            }
        }
    }
}
