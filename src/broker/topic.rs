//! Topic management
//!
//! A `Topic` holds the delivery channels currently subscribed to one topic
//! name. Every subscriber receives its own copy of each published message.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the memory
//! broker keeps it behind its lock).

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{ChannelId, DeliveryChannel};

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<ChannelId, Arc<DeliveryChannel>>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a channel to the topic. Re-adding the same channel is a no-op.
    pub fn subscribe(&mut self, channel: Arc<DeliveryChannel>) {
        self.subscribers.entry(channel.id()).or_insert(channel);
    }

    /// Remove a channel from the topic.
    pub fn unsubscribe(&mut self, id: &ChannelId) -> bool {
        self.subscribers.remove(id).is_some()
    }
}
