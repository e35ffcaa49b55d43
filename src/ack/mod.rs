//! The `ack` module tracks delivered-but-unacknowledged messages so they
//! stay redeliverable until a handler accepts them or they are abandoned.

pub mod tracker;

pub use tracker::{AckState, AckTracker};

#[cfg(test)]
mod tests;
