//! Delivery channel
//!
//! A `DeliveryChannel` is the inbound queue behind one subscription. The
//! broker's transport task pushes arrivals with [`DeliveryChannel::enqueue`];
//! a single dispatcher pulls them with [`DeliveryChannel::dequeue`].
//!
//! Ordering: strictly FIFO. Messages leave in exactly the order they were
//! enqueued; there is no priority reordering.
//!
//! `enqueue` is synchronous so it can be called from any thread, including a
//! broker callback that is not running inside the tokio runtime. `dequeue`
//! suspends on a [`Notify`] while the queue is empty and is cancel safe: the
//! head is only removed in the same synchronous step that returns it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::broker::message::Message;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug)]
pub struct DeliveryChannel {
    id: ChannelId,
    topic: String,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl DeliveryChannel {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: ChannelId::generate(),
            topic: topic.into(),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Appends `message` to the tail of the queue.
    ///
    /// Fails with [`Error::ChannelClosed`] once the channel has been closed.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        {
            let mut queue = self.lock();
            if queue.closed {
                return Err(Error::ChannelClosed);
            }
            queue.messages.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the head of the queue, waiting for one to arrive.
    ///
    /// Returns `None` as soon as the channel is closed, even if messages are
    /// still queued: closing stops new deliveries.
    pub async fn dequeue(&self) -> Option<Message> {
        loop {
            // Register before checking so a wakeup between the check and the
            // await is not lost.
            let notified = self.notify.notified();
            {
                let mut queue = self.lock();
                if queue.closed {
                    return None;
                }
                if let Some(message) = queue.messages.pop_front() {
                    return Some(message);
                }
            }
            notified.await;
        }
    }

    /// Closes the channel and wakes any waiting reader. Returns `false` if it
    /// was already closed.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut queue = self.lock();
            !std::mem::replace(&mut queue.closed, true)
        };
        if newly_closed {
            self.notify.notify_waiters();
        }
        newly_closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes every message still waiting in the queue.
    pub fn drain(&self) -> Vec<Message> {
        self.lock().messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
