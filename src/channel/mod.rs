//! The `channel` module holds the consumer side of a subscription: the
//! FIFO `DeliveryChannel` the broker feeds, and the `Subscription` record
//! describing it.

pub mod delivery;
pub mod subscription;

pub use delivery::{ChannelId, DeliveryChannel};
pub use subscription::Subscription;
