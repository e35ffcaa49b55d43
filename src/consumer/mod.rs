//! Consumer lifecycle
//!
//! [`Consumer`] owns everything one subscriber session needs: the broker
//! connection, one [`DeliveryChannel`] and [`Dispatcher`] per topic, and the
//! shared [`AckTracker`]. It walks the [`State`] machine:
//!
//! - `connect()`: Created → Connecting → Subscribed
//! - `run(handler)`: Subscribed → Dispatching
//! - `shutdown()`: Dispatching → Draining → Closed (from any other state it
//!   goes straight to Closed; on a closed consumer it does nothing)
//!
//! Concurrency and usage notes:
//! - All methods take `&self`; wrap the consumer in an `Arc` to call
//!   `shutdown` from a signal handler while `closed()` is awaited elsewhere.
//! - Transitions are serialized by an async mutex around the subscription
//!   registry. `shutdown` waits for an in-progress `connect` to finish.
//!   `subscriptions()` is empty from the moment draining starts.
//! - Draining never interrupts a handler. Messages still queued when the
//!   channels close stay in the tracker as redeliverable, unacknowledged.
//! - The registry lock is never held while waiting on a handler, so
//!   handlers may call any consumer method, `shutdown` included.

mod state;

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::ack::AckTracker;
use crate::broker::client::{BrokerClient, ChannelHandle, Connection};
use crate::channel::{DeliveryChannel, Subscription};
use crate::config::Settings;
use crate::dispatch::dispatcher::current_channel;
use crate::dispatch::{Dispatcher, Handler};
use crate::utils::error::{Error, Result};

pub use state::State;

/// What to connect to and subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub address: String,
    pub client_id: String,
    pub topics: Vec<String>,
    /// Redeliveries allowed per message before it is abandoned.
    pub max_redeliveries: u32,
}

impl ConsumerConfig {
    pub fn new<I, T>(address: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let defaults = Settings::default();
        Self {
            address: address.into(),
            client_id: defaults.broker.client_id,
            topics: topics.into_iter().map(Into::into).collect(),
            max_redeliveries: defaults.consumer.max_redeliveries,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }
}

impl From<&Settings> for ConsumerConfig {
    fn from(settings: &Settings) -> Self {
        Self::new(
            settings.broker.address.clone(),
            settings.consumer.topics.iter().cloned(),
        )
        .with_client_id(settings.broker.client_id.clone())
        .with_max_redeliveries(settings.consumer.max_redeliveries)
    }
}

struct Route {
    subscription: Subscription,
    channel: Arc<DeliveryChannel>,
    handle: ChannelHandle,
    dispatcher: Option<Dispatcher>,
}

#[derive(Default)]
struct Registry {
    connection: Option<Arc<dyn Connection>>,
    routes: Vec<Route>,
}

pub struct Consumer {
    client: Box<dyn BrokerClient>,
    config: ConsumerConfig,
    tracker: Arc<AckTracker>,
    state: Arc<watch::Sender<State>>,
    registry: Mutex<Registry>,
}

impl Consumer {
    pub fn new(client: impl BrokerClient + 'static, mut config: ConsumerConfig) -> Self {
        let mut seen = std::collections::HashSet::new();
        config.topics.retain(|topic| seen.insert(topic.clone()));

        let (state, _) = watch::channel(State::Created);
        Self {
            client: Box::new(client),
            config,
            tracker: Arc::new(AckTracker::new()),
            state: Arc::new(state),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn from_settings(client: impl BrokerClient + 'static, settings: &Settings) -> Self {
        Self::new(client, ConsumerConfig::from(settings))
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Shared acknowledgement state. Outlives `shutdown`, so the caller can
    /// see what was left unacknowledged.
    pub fn tracker(&self) -> Arc<AckTracker> {
        self.tracker.clone()
    }

    /// Current subscriptions. Empty before `connect` and after `shutdown`.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        let registry = self.registry.lock().await;
        registry
            .routes
            .iter()
            .map(|route| route.subscription.clone())
            .collect()
    }

    /// Connects to the broker and subscribes every configured topic.
    ///
    /// An unreachable broker yields [`Error::Connect`] and leaves the
    /// consumer `Closed`; there is no retry.
    pub async fn connect(&self) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.expect_state("connect", State::Created)?;
        self.set_state(State::Connecting);

        let address = self.config.address.as_str();
        info!(client_id = %self.config.client_id, address, "connecting to broker");

        let connection = match self.client.connect(address).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(client_id = %self.config.client_id, "{e}");
                self.set_state(State::Closed);
                return Err(e.into());
            }
        };

        let mut routes = Vec::with_capacity(self.config.topics.len());
        for topic in &self.config.topics {
            let channel = Arc::new(DeliveryChannel::new(topic.as_str()));
            match connection.subscribe(topic, channel.clone()).await {
                Ok(handle) => {
                    info!(topic = %topic, channel_id = %handle.channel_id, "subscribed");
                    routes.push(Route {
                        subscription: Subscription::new(topic.as_str(), channel.id()),
                        channel,
                        handle,
                        dispatcher: None,
                    });
                }
                Err(e) => {
                    error!(topic = %topic, "subscribe failed: {e}");
                    release(connection.as_ref(), &mut routes).await;
                    connection.disconnect().await;
                    self.set_state(State::Closed);
                    return Err(e);
                }
            }
        }

        registry.connection = Some(connection);
        registry.routes = routes;
        self.set_state(State::Subscribed);
        Ok(())
    }

    /// Starts one dispatcher per subscription, all sharing `handler`.
    pub async fn run(&self, handler: impl Handler) -> Result<()> {
        let mut registry = self.registry.lock().await;
        self.expect_state("run", State::Subscribed)?;
        let Some(connection) = registry.connection.clone() else {
            return Err(Error::InvalidState {
                operation: "run",
                state: self.state(),
            });
        };

        let handler: Arc<dyn Handler> = Arc::new(handler);
        for route in registry.routes.iter_mut() {
            route.dispatcher = Some(Dispatcher::start(
                route.channel.clone(),
                handler.clone(),
                self.tracker.clone(),
                connection.clone(),
            ));
        }

        self.set_state(State::Dispatching);
        info!(
            client_id = %self.config.client_id,
            channels = registry.routes.len(),
            "dispatching"
        );
        Ok(())
    }

    /// Stops dispatch, lets in-flight handlers finish, then unsubscribes and
    /// disconnects. Idempotent.
    ///
    /// The registry lock is released before the dispatchers are joined, so
    /// handlers may call back into the consumer while it drains. Called from
    /// inside a handler, it stops dispatch and returns at once; the drain
    /// finishes in the background once that handler returns. A second call
    /// while draining waits for `Closed`, or returns at once from a handler.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        let state = self.state();
        match state {
            State::Closed => {
                debug!("shutdown requested on closed consumer");
                return;
            }
            State::Draining => {
                drop(registry);
                if current_channel().is_none() {
                    self.closed().await;
                }
                return;
            }
            _ => {}
        }
        info!(client_id = %self.config.client_id, %state, "shutting down");

        for route in &registry.routes {
            route.channel.close();
            if let Some(dispatcher) = &route.dispatcher {
                dispatcher.stop();
            }
        }
        let teardown = Teardown {
            client_id: self.config.client_id.clone(),
            routes: std::mem::take(&mut registry.routes),
            connection: registry.connection.take(),
            tracker: self.tracker.clone(),
            state: self.state.clone(),
        };

        if state != State::Dispatching {
            teardown.run().await;
            return;
        }

        self.set_state(State::Draining);
        drop(registry);
        if current_channel().is_some() {
            debug!("shutdown called from a handler, draining in the background");
            tokio::spawn(teardown.run());
        } else {
            teardown.run().await;
        }
    }

    /// Resolves once the consumer reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_closed()).await;
    }

    /// Puts nacked and failed messages back on their channels.
    ///
    /// Messages that already used up `max_redeliveries` are abandoned.
    /// Returns how many were requeued.
    pub async fn redeliver(&self) -> Result<usize> {
        let registry = self.registry.lock().await;
        self.expect_state("redeliver", State::Dispatching)?;

        let mut requeued = 0;
        for message in self.tracker.take_redeliverable() {
            let id = message.id().clone();
            let attempts = self.tracker.attempts(&id);
            if attempts > self.config.max_redeliveries {
                let _ = self.tracker.abandon(&id);
                warn!(
                    %id,
                    attempts,
                    "abandoning message after {} redeliveries",
                    self.config.max_redeliveries
                );
                continue;
            }

            let route = registry
                .routes
                .iter()
                .find(|route| route.channel.topic() == message.topic());
            match route.map(|route| route.channel.enqueue(message)) {
                Some(Ok(())) => requeued += 1,
                Some(Err(e)) => {
                    let _ = self.tracker.nack(&id);
                    debug!(%id, "could not requeue: {e}");
                }
                None => {
                    let _ = self.tracker.abandon(&id);
                    warn!(%id, "no subscription for message topic, abandoning");
                }
            }
        }

        if requeued > 0 {
            info!(requeued, "redelivering unacknowledged messages");
        }
        Ok(requeued)
    }

    fn expect_state(&self, operation: &'static str, expected: State) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }

    fn set_state(&self, next: State) {
        transition(&self.state, next);
    }
}

fn transition(state: &watch::Sender<State>, next: State) {
    let previous = state.send_replace(next);
    debug!(from = %previous, to = %next, "state change");
}

/// Everything shutdown still has to finish once dispatch is stopped. Owns
/// its routes so it can run without the registry lock, or on its own task.
struct Teardown {
    client_id: String,
    routes: Vec<Route>,
    connection: Option<Arc<dyn Connection>>,
    tracker: Arc<AckTracker>,
    state: Arc<watch::Sender<State>>,
}

impl Teardown {
    async fn run(mut self) {
        for route in self.routes.iter_mut() {
            if let Some(dispatcher) = route.dispatcher.take() {
                let stats = dispatcher.join().await;
                info!(
                    topic = route.channel.topic(),
                    acked = stats.acked,
                    nacked = stats.nacked,
                    failed = stats.failed,
                    "dispatcher drained"
                );
            }
            let left = route.channel.drain();
            for message in &left {
                self.tracker.track_undelivered(message);
            }
            if !left.is_empty() {
                info!(
                    topic = route.channel.topic(),
                    count = left.len(),
                    "undispatched messages kept unacknowledged"
                );
            }
        }

        match self.connection.take() {
            Some(connection) => {
                release(connection.as_ref(), &mut self.routes).await;
                connection.disconnect().await;
            }
            None => {
                for route in self.routes.iter_mut() {
                    route.subscription.deactivate();
                }
            }
        }

        let unacked = self.tracker.len();
        if unacked > 0 {
            warn!(unacked, "closing with unacknowledged messages");
        }
        transition(&self.state, State::Closed);
        info!(client_id = %self.client_id, "consumer closed");
    }
}

/// Deactivates and closes every route and unsubscribes it from the broker.
async fn release(connection: &dyn Connection, routes: &mut [Route]) {
    for route in routes.iter_mut() {
        route.subscription.deactivate();
        route.channel.close();
        if let Err(e) = connection.unsubscribe(&route.handle).await {
            warn!(topic = %route.handle.topic, "unsubscribe failed: {e}");
        }
    }
}
