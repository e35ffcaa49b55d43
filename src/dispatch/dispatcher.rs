//! Dispatcher
//!
//! One dispatcher drives one [`DeliveryChannel`]. Its loop:
//!
//! ```text
//! dequeue ─► tracker.mark_delivered ─► handler(message)
//!                                         ├─ Ack        ─► tracker.ack ─► connection.acknowledge
//!                                         ├─ Nack       ─► tracker.nack (stays unacknowledged)
//!                                         └─ Err/panic  ─► tracker.nack (stays unacknowledged)
//! ```
//!
//! Rules:
//! - at most one handler invocation in flight per channel, so messages are
//!   handled and acknowledged in channel order
//! - handler failures are logged and recovered; the loop keeps going
//! - [`Dispatcher::stop`] is cooperative: the token is only checked while
//!   waiting for the next message, never while a handler is running

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ack::AckTracker;
use crate::broker::client::Connection;
use crate::broker::message::Message;
use crate::channel::{ChannelId, DeliveryChannel};
use crate::dispatch::handler::{Handler, Verdict};
use crate::utils::error::Error;

tokio::task_local! {
    static CURRENT_CHANNEL: ChannelId;
}

/// The channel whose dispatch loop is running the calling task, if any.
/// Handlers run inline in that task, so this is set while a handler runs.
pub fn current_channel() -> Option<ChannelId> {
    CURRENT_CHANNEL.try_with(|id| *id).ok()
}

/// Per-dispatcher outcome counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: u64,
    pub nacked: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    nacked: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher {
    topic: String,
    token: CancellationToken,
    counters: Arc<Counters>,
    join: JoinHandle<()>,
}

struct DispatchLoop {
    channel: Arc<DeliveryChannel>,
    handler: Arc<dyn Handler>,
    tracker: Arc<AckTracker>,
    connection: Arc<dyn Connection>,
    counters: Arc<Counters>,
    token: CancellationToken,
}

impl Dispatcher {
    /// Spawns the dispatch loop for `channel` on the current tokio runtime.
    pub fn start(
        channel: Arc<DeliveryChannel>,
        handler: Arc<dyn Handler>,
        tracker: Arc<AckTracker>,
        connection: Arc<dyn Connection>,
    ) -> Self {
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let topic = channel.topic().to_string();
        let channel_id = channel.id();

        let dispatch = DispatchLoop {
            channel,
            handler,
            tracker,
            connection,
            counters: counters.clone(),
            token: token.clone(),
        };
        let join = tokio::spawn(CURRENT_CHANNEL.scope(channel_id, dispatch.run()));

        Self {
            topic,
            token,
            counters,
            join,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Asks the loop to exit once the current handler invocation returns.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.join.is_finished()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Waits for the loop to exit and returns its final counters.
    pub async fn join(self) -> DispatchStats {
        if let Err(e) = self.join.await {
            error!(topic = %self.topic, "dispatcher task failed: {e}");
        }
        self.counters.snapshot()
    }
}

impl DispatchLoop {
    async fn run(self) {
        debug!(topic = %self.channel.topic(), "dispatcher started");
        loop {
            let message = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = self.channel.dequeue() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.dispatch(message).await;
        }
        debug!(topic = %self.channel.topic(), "dispatcher stopped");
    }

    async fn dispatch(&self, message: Message) {
        let id = message.id().clone();
        let attempt = self.tracker.mark_delivered(&message);

        let handler = self.handler.clone();
        let outcome = AssertUnwindSafe(async move { handler.handle(message).await })
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(Verdict::Ack)) => {
                if let Err(e) = self.tracker.ack(&id) {
                    // Abandoned while the handler was running.
                    debug!(%id, "ack not tracked: {e}");
                }
                if let Err(e) = self.connection.acknowledge(&id).await {
                    warn!(%id, "failed to forward acknowledgement: {e}");
                }
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Ok(Verdict::Nack)) => {
                self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                Error::HandlerFailure("handler returned nack".to_string())
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Error::HandlerFailure(e.to_string())
            }
            Err(panic) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Error::HandlerFailure(format!("handler panicked: {}", panic_reason(&*panic)))
            }
        };

        if let Err(e) = self.tracker.nack(&id) {
            // Abandoned while the handler was running.
            debug!(%id, "nack not tracked: {e}");
        }
        warn!(
            topic = %self.channel.topic(),
            %id,
            attempt,
            label = failure.as_label(),
            "{failure}; message left for redelivery"
        );
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
