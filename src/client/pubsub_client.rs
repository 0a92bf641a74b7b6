//! Client representation
//!
//! `Client` models one connected peer and holds the sending side of a
//! per-client channel. The transport's send loop drains that channel into
//! the socket, so writing to a `Client` never waits on the network.
//!
//! The same type backs both ends: the server keeps one per accepted
//! connection, and the connector uses one for its outbound side.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::transport::Connection;
use crate::utils::error::TransportError;

#[derive(Debug)]
pub struct Client {
    pub id: String,
    sender: UnboundedSender<WsMessage>,
    connected: AtomicBool,
    name: Mutex<Option<String>>,
    subscriptions: Mutex<Vec<String>>,
}

impl Client {
    /// Create a new client with a sender channel. The `id` is a UUID used
    /// to identify the client across broker operations.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: impl Into<String>, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            sender,
            connected: AtomicBool::new(true),
            name: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    /// Marks the client as gone. Further sends fail with `Closed`.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Marks the client disconnected and asks the send loop to close the
    /// socket. Only the first call sends the close frame.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.sender.send(WsMessage::Close(None));
        }
    }

    pub fn add_subscription(&self, queue: &str) {
        let mut subs = self.subscriptions.lock();
        if !subs.iter().any(|q| q.eq_ignore_ascii_case(queue)) {
            subs.push(queue.to_string());
        }
    }

    pub fn remove_subscription(&self, queue: &str) {
        self.subscriptions
            .lock()
            .retain(|q| !q.eq_ignore_ascii_case(queue));
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

impl Connection for Client {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.id.clone()));
        }
        self.sender
            .send(WsMessage::binary(frame))
            .map_err(|e| TransportError::SendFailed {
                client: self.id.clone(),
                reason: e.to_string(),
            })
    }
}
