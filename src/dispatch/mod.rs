//! The `dispatch` module turns queued messages into handler invocations.
//!
//! - `handler`: the application-facing `Handler` trait and its `Verdict`.
//! - `dispatcher`: the per-channel loop that invokes the handler and applies
//!   the resulting acknowledgement.

pub mod dispatcher;
pub mod handler;

pub use dispatcher::{DispatchStats, Dispatcher, current_channel};
pub use handler::{Handler, HandlerError, Verdict};

#[cfg(test)]
mod tests;
