//! Acknowledgement tracker
//!
//! Keeps every message that has been handed out but not yet acknowledged,
//! so it can be redelivered. Entries are evicted the moment they are
//! acknowledged; a stored entry is therefore always unacknowledged, and an id
//! is never tracked twice (re-marking it updates the existing entry).
//!
//! The map is a `DashMap`, so each entry is guarded by its shard lock. The
//! dispatchers (writers) and a redelivery pass (reader) can run concurrently
//! without losing acknowledgements.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use tracing::trace;

use crate::broker::message::{Message, MessageId};
use crate::utils::error::{Error, Result};

/// Snapshot of one tracked message.
///
/// Only unacknowledged messages are tracked, so there is no acknowledged
/// flag: an entry exists exactly while the message is delivered and not yet
/// acknowledged. `in_flight` is narrower than "delivered". It is true while
/// the message sits in a channel or a handler, and false once a nack or a
/// failure makes it eligible for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckState {
    pub in_flight: bool,
    /// How many times the message was handed to a handler.
    pub attempts: u32,
}

#[derive(Debug)]
struct Entry {
    message: Message,
    state: AckState,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    entries: DashMap<MessageId, Entry>,
    next_seq: AtomicU64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `message` is being handed to a handler and returns the
    /// attempt number, starting at 1.
    pub fn mark_delivered(&self, message: &Message) -> u32 {
        let mut entry = self.entry(message);
        entry.state.in_flight = true;
        entry.state.attempts += 1;
        trace!(id = %message.id(), attempt = entry.state.attempts, "marked delivered");
        entry.state.attempts
    }

    /// Tracks a message that was received but never reached a handler, such
    /// as one still queued when its channel closed. It starts redeliverable
    /// and keeps its attempt count.
    pub fn track_undelivered(&self, message: &Message) {
        let mut entry = self.entry(message);
        entry.state.in_flight = false;
        trace!(id = %message.id(), "tracked undelivered");
    }

    /// Acknowledges and evicts `id`.
    pub fn ack(&self, id: &MessageId) -> Result<()> {
        match self.entries.remove(id) {
            Some(_) => {
                trace!(%id, "acknowledged");
                Ok(())
            }
            None => Err(Error::UnknownMessage(id.clone())),
        }
    }

    /// Keeps `id` unacknowledged but returns it to the redeliverable pool.
    pub fn nack(&self, id: &MessageId) -> Result<()> {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.state.in_flight = false;
                Ok(())
            }
            None => Err(Error::UnknownMessage(id.clone())),
        }
    }

    /// Gives up on `id` without acknowledging it.
    pub fn abandon(&self, id: &MessageId) -> Result<Message> {
        self.entries
            .remove(id)
            .map(|(_, entry)| entry.message)
            .ok_or_else(|| Error::UnknownMessage(id.clone()))
    }

    /// Ids of all unacknowledged messages, oldest first delivery first.
    pub fn pending_unacked(&self) -> Vec<MessageId> {
        let mut pending: Vec<(u64, MessageId)> = self
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.key().clone()))
            .collect();
        pending.sort_unstable_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, id)| id).collect()
    }

    /// Unacknowledged messages that are not currently out for delivery.
    pub fn redeliverable(&self) -> Vec<Message> {
        self.collect(|entry| !entry.state.in_flight)
    }

    /// Like [`AckTracker::redeliverable`], but flags the returned messages as
    /// in flight so a concurrent pass cannot hand them out twice.
    pub fn take_redeliverable(&self) -> Vec<Message> {
        let mut taken: Vec<(u64, Message)> = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.state.in_flight {
                entry.state.in_flight = true;
                taken.push((entry.seq, entry.message.clone()));
            }
        }
        taken.sort_unstable_by_key(|(seq, _)| *seq);
        taken.into_iter().map(|(_, message)| message).collect()
    }

    pub fn state(&self, id: &MessageId) -> Option<AckState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub fn attempts(&self, id: &MessageId) -> u32 {
        self.state(id).map_or(0, |state| state.attempts)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn entry(&self, message: &Message) -> RefMut<'_, MessageId, Entry> {
        self.entries
            .entry(message.id().clone())
            .or_insert_with(|| Entry {
                message: message.clone(),
                state: AckState {
                    in_flight: false,
                    attempts: 0,
                },
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            })
    }

    fn collect(&self, keep: impl Fn(&Entry) -> bool) -> Vec<Message> {
        let mut selected: Vec<(u64, Message)> = self
            .entries
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| (entry.seq, entry.message.clone()))
            .collect();
        selected.sort_unstable_by_key(|(seq, _)| *seq);
        selected.into_iter().map(|(_, message)| message).collect()
    }
}
