//! In-process broker
//!
//! `MemoryBroker` stands in for a real message broker: it keeps topics and
//! their subscribed channels, fans published messages out to every
//! subscriber, and records the acknowledgements it receives. It backs the
//! `demo` command and the test suite.
//!
//! Clones share state, so a test can keep one handle for publishing while
//! the consumer owns another as its `BrokerClient`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use tracing::debug;

use crate::broker::client::{BrokerClient, ChannelHandle, Connection};
use crate::broker::message::{Message, MessageId};
use crate::broker::topic::Topic;
use crate::channel::DeliveryChannel;
use crate::utils::error::{ConnectError, Error, Result};

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    acknowledged: Vec<MessageId>,
    connections: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// When unreachable, every `connect` fails with `ConnectError`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Publishes under a freshly generated id.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> MessageId {
        let id = MessageId::generate();
        self.publish_with_id(id.clone(), topic, payload);
        id
    }

    /// Delivers a copy of the message to every channel subscribed to `topic`
    /// and returns how many accepted it. Closed channels are skipped.
    pub fn publish_with_id(
        &self,
        id: impl Into<MessageId>,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> usize {
        let message = Message::new(id, topic, payload);
        let state = self.lock();

        let Some(topic) = state.topics.get(topic) else {
            debug!(topic, "no subscribers, dropping message {}", message.id());
            return 0;
        };

        let mut delivered = 0;
        for (channel_id, channel) in &topic.subscribers {
            match channel.enqueue(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(%channel_id, "skipping subscriber: {e}"),
            }
        }
        delivered
    }

    /// Acknowledgements received so far, in arrival order.
    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.lock().acknowledged.clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.subscribers.len())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerClient for MemoryBroker {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnectError>> {
        let result = if self.reachable.load(Ordering::SeqCst) {
            self.lock().connections += 1;
            debug!(address, "memory broker accepted connection");
            Ok(Arc::new(MemoryConnection::new(self.clone())) as Arc<dyn Connection>)
        } else {
            Err(ConnectError::new(address, "broker unreachable"))
        };
        ready(result).boxed()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    handles: Mutex<Vec<ChannelHandle>>,
    open: AtomicBool,
}

impl MemoryConnection {
    fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            handles: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Broker("connection is closed".to_string()))
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<ChannelHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe_now(&self, topic: &str, channel: Arc<DeliveryChannel>) -> Result<ChannelHandle> {
        self.ensure_open()?;
        let handle = ChannelHandle::new(&channel);
        self.broker
            .lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(channel);
        self.handles().push(handle.clone());
        debug!(topic, channel_id = %handle.channel_id, "subscribed");
        Ok(handle)
    }

    fn unsubscribe_now(&self, handle: &ChannelHandle) -> Result<()> {
        self.ensure_open()?;
        if let Some(topic) = self.broker.lock().topics.get_mut(&handle.topic) {
            topic.unsubscribe(&handle.channel_id);
        }
        self.handles().retain(|h| h != handle);
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        channel: Arc<DeliveryChannel>,
    ) -> BoxFuture<'a, Result<ChannelHandle>> {
        ready(self.subscribe_now(topic, channel)).boxed()
    }

    fn unsubscribe<'a>(&'a self, handle: &'a ChannelHandle) -> BoxFuture<'a, Result<()>> {
        ready(self.unsubscribe_now(handle)).boxed()
    }

    fn acknowledge<'a>(&'a self, id: &'a MessageId) -> BoxFuture<'a, Result<()>> {
        let result = self.ensure_open().map(|()| {
            self.broker.lock().acknowledged.push(id.clone());
        });
        ready(result).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let handles = std::mem::take(&mut *self.handles());
            let mut state = self.broker.lock();
            for handle in &handles {
                if let Some(topic) = state.topics.get_mut(&handle.topic) {
                    topic.unsubscribe(&handle.channel_id);
                }
            }
            state.connections = state.connections.saturating_sub(1);
            debug!(released = handles.len(), "memory broker connection closed");
        }
        ready(()).boxed()
    }
}
