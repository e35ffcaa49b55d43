//! The `broker` module is the boundary to the message broker.
//!
//! - `client`: the `BrokerClient` / `Connection` traits the consumer drives.
//! - `message`: the immutable `Message` record and its `MessageId`.
//! - `memory`: an in-process broker implementing those traits.
//! - `topic`: per-topic subscriber bookkeeping used by the memory broker.

pub mod client;
pub mod memory;
pub mod message;
pub mod topic;

pub use client::{BrokerClient, ChannelHandle, Connection};
pub use memory::MemoryBroker;
pub use message::{Message, MessageId};
