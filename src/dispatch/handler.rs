//! Application message handlers.
//!
//! A handler is invoked once per message and answers with a [`Verdict`].
//! Any `async` closure or function of shape
//! `Fn(Message) -> impl Future<Output = Result<Verdict, HandlerError>>`
//! implements [`Handler`] through the blanket impl below.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::broker::message::Message;

/// What the handler decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processed; acknowledge it.
    Ack,
    /// Not processed; leave it for redelivery.
    Nack,
}

/// Error raised by a handler. Treated the same as [`Verdict::Nack`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<Verdict, HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Verdict, HandlerError>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<Verdict, HandlerError>> {
        self(message).boxed()
    }
}
