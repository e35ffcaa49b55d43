//! WebSocket broker client
//!
//! Speaks the popsub JSON protocol as a subscriber. Responsibilities:
//! - open the WebSocket and complete the login -> auth handshake before
//!   anything else; a refused or failed handshake is a `ConnectError`
//! - translate `subscribe` / `unsubscribe` / `acknowledge` into client frames
//! - route inbound `message` frames to the delivery channels registered for
//!   their topic
//!
//! After the handshake the socket is split: a writer task drains an unbounded
//! channel of outbound frames, a reader task routes inbound frames. Neither
//! ever blocks on a handler, so a slow handler cannot stall the socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::client::{BrokerClient, ChannelHandle, Connection};
use crate::broker::message::{Message, MessageId};
use crate::channel::DeliveryChannel;
use crate::config::BrokerSettings;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{ConnectError, Error, Result};

/// How long `disconnect` waits for the close frame to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl From<&BrokerSettings> for Credentials {
    fn from(settings: &BrokerSettings) -> Self {
        Self::new(settings.username.clone(), settings.password.clone())
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketClient {
    credentials: Credentials,
}

impl WebSocketClient {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl BrokerClient for WebSocketClient {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Connection>, ConnectError>> {
        async move {
            let connection = WebSocketConnection::open(address, &self.credentials).await?;
            Ok(Arc::new(connection) as Arc<dyn Connection>)
        }
        .boxed()
    }
}

type Routes = Arc<Mutex<HashMap<String, Vec<Arc<DeliveryChannel>>>>>;

pub struct WebSocketConnection {
    outbound: mpsc::UnboundedSender<WsMessage>,
    routes: Routes,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl WebSocketConnection {
    async fn open(address: &str, credentials: &Credentials) -> Result<Self, ConnectError> {
        let refused = |reason: String| ConnectError::new(address, reason);

        let (stream, _response) = connect_async(address)
            .await
            .map_err(|e| refused(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let login = ClientMessage::Login {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };
        send_frame(&mut sink, &login).await.map_err(refused)?;
        let token = match next_server_message(&mut source).await.map_err(refused)? {
            ServerMessage::LoginResponse { token } => token,
            ServerMessage::Error { message } => {
                return Err(refused(format!("login rejected: {message}")));
            }
            other => return Err(refused(format!("unexpected reply to login: {other:?}"))),
        };

        send_frame(&mut sink, &ClientMessage::Auth { token })
            .await
            .map_err(refused)?;
        match next_server_message(&mut source).await.map_err(refused)? {
            ServerMessage::Authenticated {} => {}
            ServerMessage::Error { message } => {
                return Err(refused(format!("authentication failed: {message}")));
            }
            other => return Err(refused(format!("unexpected reply to auth: {other:?}"))),
        }
        info!(address, "authenticated with broker");

        let (outbound, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = frame.is_close();
                if let Err(e) = sink.send(frame).await {
                    warn!("failed to send frame to broker: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let routes = Routes::default();
        let reader = tokio::spawn(read_loop(source, routes.clone()));

        Ok(Self {
            outbound,
            routes,
            tasks: Mutex::new(Some((writer, reader))),
        })
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(WsMessage::text(text))
            .map_err(|_| Error::Broker("connection is closed".to_string()))
    }

    fn subscribe_now(&self, topic: &str, channel: Arc<DeliveryChannel>) -> Result<ChannelHandle> {
        let handle = ChannelHandle::new(&channel);
        lock(&self.routes)
            .entry(topic.to_string())
            .or_default()
            .push(channel);

        if let Err(e) = self.send(&ClientMessage::Subscribe {
            topic: topic.to_string(),
        }) {
            self.forget(&handle);
            return Err(e);
        }
        debug!(topic, channel_id = %handle.channel_id, "subscribe sent");
        Ok(handle)
    }

    fn unsubscribe_now(&self, handle: &ChannelHandle) -> Result<()> {
        if self.forget(handle) {
            self.send(&ClientMessage::Unsubscribe {
                topic: handle.topic.clone(),
            })?;
        }
        Ok(())
    }

    /// Drops the route for `handle`; true if its topic has no channel left.
    fn forget(&self, handle: &ChannelHandle) -> bool {
        let mut routes = lock(&self.routes);
        let Some(channels) = routes.get_mut(&handle.topic) else {
            return false;
        };
        channels.retain(|channel| channel.id() != handle.channel_id);
        if channels.is_empty() {
            routes.remove(&handle.topic);
            true
        } else {
            false
        }
    }

    fn take_tasks(&self) -> Option<(JoinHandle<()>, JoinHandle<()>)> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Connection for WebSocketConnection {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        channel: Arc<DeliveryChannel>,
    ) -> BoxFuture<'a, Result<ChannelHandle>> {
        ready(self.subscribe_now(topic, channel)).boxed()
    }

    fn unsubscribe<'a>(&'a self, handle: &'a ChannelHandle) -> BoxFuture<'a, Result<()>> {
        ready(self.unsubscribe_now(handle)).boxed()
    }

    fn acknowledge<'a>(&'a self, id: &'a MessageId) -> BoxFuture<'a, Result<()>> {
        let ack = ClientMessage::Ack {
            message_id: id.to_string(),
        };
        ready(self.send(&ack)).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        async move {
            let Some((writer, reader)) = self.take_tasks() else {
                return;
            };

            let _ = self.outbound.send(WsMessage::Close(None));
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("timed out flushing close frame");
                abort.abort();
            }
            reader.abort();
            lock(&self.routes).clear();
            info!("disconnected from broker");
        }
        .boxed()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((writer, reader)) = tasks {
            writer.abort();
            reader.abort();
        }
    }
}

async fn send_frame<S>(sink: &mut S, message: &ClientMessage) -> std::result::Result<(), String>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(WsMessage::text(text))
        .await
        .map_err(|e| e.to_string())
}

async fn next_server_message<S>(source: &mut S) -> std::result::Result<ServerMessage, String>
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame.map_err(|e| e.to_string())? {
            WsMessage::Text(text) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| format!("malformed frame: {e}"));
            }
            WsMessage::Close(_) => return Err("broker closed the connection".to_string()),
            _ => continue,
        }
    }
    Err("connection ended during handshake".to_string())
}

async fn read_loop<S>(mut source: S, routes: Routes)
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => route_frame(&routes, text.as_str()),
            Ok(WsMessage::Close(_)) => {
                info!("broker closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("websocket read failed: {e}");
                break;
            }
        }
    }
    debug!("reader stopped");
}

fn route_frame(routes: &Routes, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Message {
            topic,
            payload,
            message_id,
            ..
        }) => {
            let message = Message::new(message_id, topic, payload);
            let channels = lock(routes)
                .get(message.topic())
                .cloned()
                .unwrap_or_default();
            if channels.is_empty() {
                debug!(topic = message.topic(), "no channel for message {}", message.id());
            }
            for channel in channels {
                if let Err(e) = channel.enqueue(message.clone()) {
                    debug!(channel_id = %channel.id(), "dropping message {}: {e}", message.id());
                }
            }
        }
        Ok(ServerMessage::Error { message }) => warn!("broker reported error: {message}"),
        Ok(other) => debug!("ignoring frame: {other:?}"),
        Err(e) => warn!(
            "invalid frame from broker: {e} | {}",
            text.chars().take(100).collect::<String>()
        ),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
