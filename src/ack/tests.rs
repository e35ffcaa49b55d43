use std::sync::Arc;

use super::{AckState, AckTracker};
use crate::broker::message::{Message, MessageId};
use crate::utils::error::Error;

fn message(id: &str) -> Message {
    Message::new(id, "T", "body")
}

fn ids(values: &[&str]) -> Vec<MessageId> {
    values.iter().map(|v| MessageId::from(*v)).collect()
}

#[test]
fn test_ack_after_mark_delivered_removes_entry() {
    let tracker = AckTracker::new();
    tracker.mark_delivered(&message("1"));
    assert_eq!(tracker.pending_unacked(), ids(&["1"]));

    tracker.ack(&MessageId::from("1")).unwrap();
    assert!(tracker.pending_unacked().is_empty());
    assert!(tracker.is_empty());
}

#[test]
fn test_ack_unknown_message_fails() {
    let tracker = AckTracker::new();
    let err = tracker.ack(&MessageId::from("missing")).unwrap_err();
    assert!(matches!(err, Error::UnknownMessage(id) if id.as_str() == "missing"));
}

#[test]
fn test_double_ack_fails_the_second_time() {
    let tracker = AckTracker::new();
    tracker.mark_delivered(&message("1"));
    tracker.ack(&MessageId::from("1")).unwrap();
    assert!(tracker.ack(&MessageId::from("1")).is_err());
}

#[test]
fn test_pending_unacked_keeps_first_delivery_order() {
    let tracker = AckTracker::new();
    for id in ["3", "1", "2"] {
        tracker.mark_delivered(&message(id));
    }
    // Re-marking does not move an entry to the back.
    tracker.mark_delivered(&message("3"));
    assert_eq!(tracker.pending_unacked(), ids(&["3", "1", "2"]));
}

#[test]
fn test_mark_delivered_twice_keeps_single_entry() {
    let tracker = AckTracker::new();
    assert_eq!(tracker.mark_delivered(&message("1")), 1);
    assert_eq!(tracker.mark_delivered(&message("1")), 2);
    assert_eq!(tracker.len(), 1);
    assert_eq!(tracker.attempts(&MessageId::from("1")), 2);
}

#[test]
fn test_nack_keeps_message_redeliverable() {
    let tracker = AckTracker::new();
    tracker.mark_delivered(&message("1"));
    tracker.mark_delivered(&message("2"));
    assert!(tracker.redeliverable().is_empty());

    tracker.nack(&MessageId::from("2")).unwrap();
    assert_eq!(
        tracker.state(&MessageId::from("2")),
        Some(AckState {
            in_flight: false,
            attempts: 1
        })
    );
    let redeliverable: Vec<_> = tracker
        .redeliverable()
        .iter()
        .map(|m| m.id().clone())
        .collect();
    assert_eq!(redeliverable, ids(&["2"]));
    assert_eq!(tracker.pending_unacked(), ids(&["1", "2"]));
}

#[test]
fn test_track_undelivered_is_redeliverable_without_attempts() {
    let tracker = AckTracker::new();
    tracker.mark_delivered(&message("1"));
    tracker.track_undelivered(&message("2"));

    assert_eq!(
        tracker.state(&MessageId::from("2")),
        Some(AckState {
            in_flight: false,
            attempts: 0
        })
    );
    assert_eq!(tracker.pending_unacked(), ids(&["1", "2"]));

    let taken: Vec<_> = tracker
        .take_redeliverable()
        .iter()
        .map(|m| m.id().clone())
        .collect();
    assert_eq!(taken, ids(&["2"]));

    // Requeued, then left in a closed channel again.
    tracker.track_undelivered(&message("2"));
    assert_eq!(tracker.redeliverable().len(), 1);
    assert_eq!(tracker.attempts(&MessageId::from("2")), 0);
}

#[test]
fn test_nack_unknown_message_fails() {
    let tracker = AckTracker::new();
    assert!(matches!(
        tracker.nack(&MessageId::from("x")),
        Err(Error::UnknownMessage(_))
    ));
}

#[test]
fn test_take_redeliverable_claims_once() {
    let tracker = AckTracker::new();
    for id in ["1", "2"] {
        tracker.mark_delivered(&message(id));
        tracker.nack(&MessageId::from(id)).unwrap();
    }

    let taken: Vec<_> = tracker
        .take_redeliverable()
        .iter()
        .map(|m| m.id().clone())
        .collect();
    assert_eq!(taken, ids(&["1", "2"]));
    assert!(tracker.take_redeliverable().is_empty());
    assert_eq!(tracker.len(), 2);
}

#[test]
fn test_abandon_drops_entry() {
    let tracker = AckTracker::new();
    tracker.mark_delivered(&message("1"));
    let abandoned = tracker.abandon(&MessageId::from("1")).unwrap();
    assert_eq!(abandoned.id().as_str(), "1");
    assert!(tracker.pending_unacked().is_empty());
    assert!(tracker.abandon(&MessageId::from("1")).is_err());
}

#[test]
fn test_concurrent_acks_are_not_lost() {
    let tracker = Arc::new(AckTracker::new());
    for i in 0..200 {
        tracker.mark_delivered(&message(&i.to_string()));
    }

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in (w..200).step_by(4) {
                    tracker.ack(&MessageId::from(i.to_string())).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(tracker.is_empty());
}
