use super::error::{ConnectError, Error};
use super::logging;
use crate::broker::message::MessageId;
use tracing::Level;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn test_parse_level() {
    assert_eq!(logging::parse_level("error"), Level::ERROR);
    assert_eq!(logging::parse_level("WARNING"), Level::WARN);
    assert_eq!(logging::parse_level(" debug "), Level::DEBUG);
    assert_eq!(logging::parse_level("trace"), Level::TRACE);
    assert_eq!(logging::parse_level("nonsense"), Level::INFO);
}

#[test]
fn test_connect_error_display() {
    let err = ConnectError::new("ws://127.0.0.1:1", "connection refused");
    assert_eq!(
        err.to_string(),
        "failed to connect to ws://127.0.0.1:1: connection refused"
    );

    let err: Error = err.into();
    assert_eq!(err.as_label(), "connect_error");
    assert!(err.is_fatal());
}

#[test]
fn test_error_labels() {
    let unknown = Error::UnknownMessage(MessageId::from("42"));
    assert_eq!(unknown.to_string(), "unknown message id: 42");
    assert_eq!(unknown.as_label(), "unknown_message");
    assert!(!unknown.is_fatal());

    assert_eq!(Error::ChannelClosed.as_label(), "channel_closed");
    assert!(!Error::HandlerFailure("nack".into()).is_fatal());
}
