//! The `error` module defines the error types used across `popsub-consumer`.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is the [`Error`] enum below. Only [`Error::Connect`] is fatal, and only while
//! the consumer is starting up; the rest are surfaced to the caller or, in the
//! case of handler failures, logged and recovered locally by the dispatcher.

use thiserror::Error;

use crate::broker::message::MessageId;
use crate::consumer::State;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The broker could not be reached or refused the session.
///
/// No retry is attempted here; reconnect policy belongs to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to connect to {address}: {reason}")]
pub struct ConnectError {
    pub address: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// An operation was attempted on a channel after it was closed.
    #[error("delivery channel is closed")]
    ChannelClosed,

    /// Acknowledgement of a message id the tracker does not know about.
    #[error("unknown message id: {0}")]
    UnknownMessage(MessageId),

    /// The handler returned a nack, an error, or panicked.
    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("cannot {operation} while consumer is {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("failed to encode frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Connect(_) => "connect_error",
            Error::ChannelClosed => "channel_closed",
            Error::UnknownMessage(_) => "unknown_message",
            Error::HandlerFailure(_) => "handler_failure",
            Error::InvalidState { .. } => "invalid_state",
            Error::Broker(_) => "broker_error",
            Error::Codec(_) => "codec_error",
            Error::Config(_) => "config_error",
        }
    }

    /// Whether the process should give up on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Config(_))
    }
}
