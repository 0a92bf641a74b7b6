//! Client connector
//!
//! `MqClient` is the application's side of a broker connection. Frames go
//! out through a `Client` handle (the same channel-backed handle the server
//! keeps per peer) and come back through `handle_frame`, which the read loop
//! calls for every decoded frame.
//!
//! Behavior notes:
//! - the server's accepted frame carries the id it assigned to us
//! - pings are answered at once, terminate closes the connection
//! - acknowledgment and response frames resolve followed calls when catching
//!   is enabled; anything else is handed to the application channel
//! - with auto-acknowledge, deliveries that ask for an ack are acked on arrival

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::codec;
use crate::broker::message::{Message, MessageKind, content_types, headers, next_message_id};
use crate::broker::options::QueueOptions;
use crate::client::Client;
use crate::connector::follower::MessageFollower;
use crate::transport::Connection;
use crate::transport::dispatch::FrameAction;
use crate::utils::error::{CodecError, ConnectorError, ErrorSink, TracingErrorSink, TransportError};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Sent to the server in the hello frame.
    pub name: Option<String>,
    pub acknowledge_timeout: Duration,
    pub response_timeout: Duration,
    pub auto_acknowledge: bool,
    pub catch_acknowledges: bool,
    pub catch_responses: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: None,
            acknowledge_timeout: Duration::from_secs(15),
            response_timeout: Duration::from_secs(15),
            auto_acknowledge: false,
            catch_acknowledges: true,
            catch_responses: true,
        }
    }
}

pub struct MqClient {
    options: ClientOptions,
    connection: Arc<Client>,
    follower: MessageFollower,
    client_id: watch::Sender<Option<String>>,
    incoming: mpsc::UnboundedSender<Message>,
    catch_acknowledges: AtomicBool,
    catch_responses: AtomicBool,
    errors: Arc<dyn ErrorSink>,
}

impl MqClient {
    /// Builds a client over an outbound handle. Frames the application has
    /// to handle arrive on the returned receiver.
    pub fn with_connection(
        options: ClientOptions,
        connection: Arc<Client>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (incoming, rx) = mpsc::unbounded_channel();
        let (client_id, _) = watch::channel(None);
        let client = Self {
            catch_acknowledges: AtomicBool::new(options.catch_acknowledges),
            catch_responses: AtomicBool::new(options.catch_responses),
            options,
            connection,
            follower: MessageFollower::new(),
            client_id,
            incoming,
            errors: Arc::new(TracingErrorSink),
        };
        (client, rx)
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    /// Opens a WebSocket connection to `url`, says hello and waits for the
    /// server to accept it.
    pub async fn connect(
        url: &str,
        options: ClientOptions,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Message>), ConnectorError> {
        let (ws_stream, _) = connect_async(url).await.map_err(TransportError::from)?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let (client, incoming) = Self::with_connection(options, Arc::new(Client::new(tx)));
        let client = Arc::new(client);

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to write frame: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        {
            let client = client.clone();
            spawn(async move {
                while let Some(frame) = ws_receiver.next().await {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("Read error: {e}");
                            break;
                        }
                    };
                    if frame.is_close() {
                        break;
                    }
                    if !frame.is_binary() && !frame.is_text() {
                        continue;
                    }
                    match codec::decode(&frame.into_data()) {
                        Ok(message) => {
                            if client.handle_frame(message) == FrameAction::Disconnect {
                                break;
                            }
                        }
                        Err(e) => warn!("Invalid frame from server: {e}"),
                    }
                }
                client.on_disconnected();
            });
        }

        client.hello()?;
        client.wait_accepted(client.options.response_timeout).await?;
        info!(url, id = ?client.id(), "connected");
        Ok((client, incoming))
    }

    /// Id assigned by the server, once accepted.
    pub fn id(&self) -> Option<String> {
        self.client_id.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn follower(&self) -> &MessageFollower {
        &self.follower
    }

    pub fn set_catch_acknowledges(&self, catch: bool) {
        self.catch_acknowledges.store(catch, Ordering::SeqCst);
    }

    pub fn set_catch_responses(&self, catch: bool) {
        self.catch_responses.store(catch, Ordering::SeqCst);
    }

    fn hello(&self) -> Result<(), ConnectorError> {
        let mut hello = Message::server(content_types::HELLO, "");
        if let Some(name) = &self.options.name {
            hello.set_header(headers::CLIENT_NAME, name.clone());
        }
        self.send(&hello)
    }

    /// Waits until the accepted frame arrived.
    pub async fn wait_accepted(&self, timeout: Duration) -> Result<String, ConnectorError> {
        let mut rx = self.client_id.subscribe();
        let accepted = tokio::time::timeout(timeout, rx.wait_for(|id| id.is_some())).await;
        match accepted {
            Ok(Ok(id)) => id.clone().ok_or(ConnectorError::Handshake),
            Ok(Err(_)) | Err(_) => Err(ConnectorError::Handshake),
        }
    }

    /// Reacts to one frame from the server.
    pub fn handle_frame(&self, message: Message) -> FrameAction {
        match message.kind {
            MessageKind::Server if message.content_type == content_types::ACCEPTED => {
                debug!(id = %message.target, "accepted by server");
                self.client_id.send_replace(Some(message.target));
            }
            MessageKind::Ping => {
                if let Err(e) = self.send(&Message::pong()) {
                    self.errors.report("PONG", "server", &e);
                }
            }
            MessageKind::Pong => {}
            MessageKind::Terminate => {
                self.disconnect();
                return FrameAction::Disconnect;
            }
            MessageKind::Acknowledge => {
                let caught = self.catch_acknowledges.load(Ordering::SeqCst)
                    && self.follower.process_acknowledge(&message);
                if !caught {
                    self.deliver(message);
                }
            }
            MessageKind::Response => {
                let caught = self.catch_responses.load(Ordering::SeqCst)
                    && self.follower.process_response(&message);
                if !caught {
                    self.deliver(message);
                }
            }
            MessageKind::QueueMessage | MessageKind::Router => {
                if self.options.auto_acknowledge && message.flags.acknowledge_required {
                    if let Err(e) = self.acknowledge(&message) {
                        self.errors
                            .report("AUTO_ACKNOWLEDGE", &format!("message={}", message.id), &e);
                    }
                }
                self.deliver(message);
            }
            MessageKind::Server => self.deliver(message),
        }
        FrameAction::Continue
    }

    fn deliver(&self, message: Message) {
        if self.incoming.send(message).is_err() {
            debug!("incoming receiver dropped, frame discarded");
        }
    }

    /// Fire and forget.
    pub fn send(&self, message: &Message) -> Result<(), ConnectorError> {
        if !self.connection.is_connected() {
            return Err(ConnectorError::NotConnected);
        }
        self.connection.send(codec::encode(message)?)?;
        Ok(())
    }

    /// Sends `message` and waits for its acknowledgment. A negative
    /// acknowledgment is returned as `Rejected`.
    pub async fn send_with_acknowledge(&self, mut message: Message) -> Result<(), ConnectorError> {
        if message.id.is_empty() {
            message.id = next_message_id();
        }
        message.flags.acknowledge_required = true;

        let pending = self
            .follower
            .follow_acknowledge(&message, self.options.acknowledge_timeout);
        self.send(&message)?;
        let ack = pending.wait().await?;
        if ack.is_negative() {
            return Err(rejected(&ack));
        }
        Ok(())
    }

    /// Sends `message` and waits for its response, whatever its code.
    pub async fn request(&self, mut message: Message) -> Result<Message, ConnectorError> {
        if message.id.is_empty() {
            message.id = next_message_id();
        }
        message.flags.response_required = true;

        let pending = self
            .follower
            .follow_response(&message, self.options.response_timeout);
        self.send(&message)?;
        pending.wait().await
    }

    /// Pushes `payload` into `queue`. With `wait_acknowledge` the call
    /// returns once the broker acknowledged the push.
    pub async fn push(
        &self,
        queue: &str,
        payload: impl Into<Bytes>,
        wait_acknowledge: bool,
    ) -> Result<(), ConnectorError> {
        let message = Message::queue_message(queue, payload);
        if wait_acknowledge {
            self.send_with_acknowledge(message).await
        } else {
            self.send(&message)
        }
    }

    pub fn acknowledge(&self, message: &Message) -> Result<(), ConnectorError> {
        self.send(&message.create_acknowledge())
    }

    pub fn negative_acknowledge(&self, message: &Message, reason: &str) -> Result<(), ConnectorError> {
        self.send(&message.create_negative_acknowledge(reason))
    }

    pub async fn subscribe(&self, queue: &str) -> Result<(), ConnectorError> {
        self.management(content_types::SUBSCRIBE, queue, Bytes::new())
            .await
    }

    pub async fn unsubscribe(&self, queue: &str) -> Result<(), ConnectorError> {
        self.management(content_types::UNSUBSCRIBE, queue, Bytes::new())
            .await
    }

    /// Creates `queue`. `None` uses the server's default options.
    pub async fn create_queue(
        &self,
        queue: &str,
        options: Option<&QueueOptions>,
    ) -> Result<(), ConnectorError> {
        let payload = match options {
            Some(options) => Bytes::from(
                serde_json::to_vec(options).map_err(CodecError::Encode)?,
            ),
            None => Bytes::new(),
        };
        self.management(content_types::CREATE_QUEUE, queue, payload)
            .await
    }

    pub async fn remove_queue(&self, queue: &str) -> Result<(), ConnectorError> {
        self.management(content_types::REMOVE_QUEUE, queue, Bytes::new())
            .await
    }

    /// Server command whose response code is checked.
    async fn management(
        &self,
        content_type: u16,
        queue: &str,
        payload: Bytes,
    ) -> Result<(), ConnectorError> {
        let mut command = Message::server(content_type, queue);
        command.payload = payload;
        let response = self.request(command).await?;
        if response.is_negative() {
            return Err(rejected(&response));
        }
        Ok(())
    }

    pub fn ping(&self) -> Result<(), ConnectorError> {
        self.send(&Message::ping())
    }

    /// Closes the connection and fails every outstanding wait.
    pub fn disconnect(&self) {
        self.on_disconnected();
    }

    fn on_disconnected(&self) {
        self.connection.close();
        let failed = self.follower.fail_all();
        if failed > 0 {
            debug!(failed, "pending correlations failed on disconnect");
        }
    }
}

impl std::fmt::Debug for MqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqClient")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .field("follower", &self.follower)
            .finish()
    }
}

fn rejected(frame: &Message) -> ConnectorError {
    ConnectorError::Rejected {
        id: frame.id.clone(),
        code: frame.code,
        reason: frame
            .find_header(headers::NEGATIVE_ACKNOWLEDGE_REASON)
            .map(str::to_string)
            .or_else(|| frame.content_str().filter(|s| !s.is_empty()).map(str::to_string))
            .unwrap_or_default(),
    }
}
