//! # popsub-consumer
//!
//! `popsub-consumer` is the subscriber side of a topic publish/subscribe
//! system. It connects to a broker, subscribes to one or more topics, hands
//! each message to an application handler and acknowledges the ones the
//! handler accepts. Anything not acknowledged stays eligible for redelivery.
//!
//! ## Core Modules
//!
//! - `channel`: per-subscription FIFO queues fed by the broker connection.
//! - `ack`: tracks delivered-but-unacknowledged messages.
//! - `dispatch`: the `Handler` trait and the loop that drives it.
//! - `consumer`: the lifecycle controller (connect, run, shutdown).
//! - `broker`: the broker client abstraction and an in-memory broker.
//! - `transport`: a WebSocket client for the popsub JSON protocol.
//! - `config`: layered settings from file and environment.
//! - `utils`: error types, logging and signal handling.

pub mod ack;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod transport;
pub mod utils;

pub use ack::AckTracker;
pub use broker::{BrokerClient, Connection, MemoryBroker, Message, MessageId};
pub use channel::{DeliveryChannel, Subscription};
pub use consumer::{Consumer, ConsumerConfig, State};
pub use dispatch::{Dispatcher, Handler, HandlerError, Verdict};
pub use utils::error::{ConnectError, Error, Result};
