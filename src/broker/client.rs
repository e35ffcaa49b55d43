//! Broker client interface
//!
//! The delivery core never talks to the wire itself. It is handed a
//! [`BrokerClient`], asks it for a [`Connection`], and registers one
//! [`DeliveryChannel`] per topic on that connection. From then on the
//! broker's own transport task pushes arrivals into the channel with
//! [`DeliveryChannel::enqueue`] and the dispatcher calls back into
//! [`Connection::acknowledge`] once a handler has accepted a message.
//!
//! Futures are boxed so both traits stay object safe; the consumer holds the
//! connection as `Arc<dyn Connection>`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::broker::message::MessageId;
use crate::channel::{ChannelId, DeliveryChannel};
use crate::utils::error::{ConnectError, Result};

/// Broker-side view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    pub topic: String,
}

impl ChannelHandle {
    pub fn new(channel: &DeliveryChannel) -> Self {
        Self {
            channel_id: channel.id(),
            topic: channel.topic().to_string(),
        }
    }
}

/// Opens sessions against a broker.
pub trait BrokerClient: Send + Sync {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnectError>>;
}

/// A live broker session.
pub trait Connection: Send + Sync {
    /// Start routing messages published on `topic` into `channel`.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        channel: Arc<DeliveryChannel>,
    ) -> BoxFuture<'a, Result<ChannelHandle>>;

    fn unsubscribe<'a>(&'a self, handle: &'a ChannelHandle) -> BoxFuture<'a, Result<()>>;

    /// Tell the broker a message was processed and may be discarded.
    fn acknowledge<'a>(&'a self, id: &'a MessageId) -> BoxFuture<'a, Result<()>>;

    /// Close the session. Calling it twice is harmless.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}
