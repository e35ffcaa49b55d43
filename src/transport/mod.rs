//! The `transport` module connects the consumer to a popsub server over
//! WebSockets.
//!
//! It defines the JSON messaging protocol shared with the server and the
//! `WebSocketClient` broker client built on top of it.

pub mod message;
pub mod websocket;

pub use message::{ClientMessage, ServerMessage};
pub use websocket::{Credentials, WebSocketClient, WebSocketConnection};
