use std::fmt;

/// Lifecycle of a [`Consumer`](crate::consumer::Consumer).
///
/// ```text
/// Created ─► Connecting ─► Subscribed ─► Dispatching ─► Draining ─► Closed
///    │            │             │                                    ▲
///    └────────────┴─────────────┴──── shutdown / failed connect ─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Created,
    Connecting,
    Subscribed,
    Dispatching,
    Draining,
    Closed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Connecting => "connecting",
            State::Subscribed => "subscribed",
            State::Dispatching => "dispatching",
            State::Draining => "draining",
            State::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
