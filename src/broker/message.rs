//! Message definitions for the broker
//!
//! `Message` is the canonical wire/internal representation. Every frame that
//! crosses a connection is a `Message`; its `kind` tells the reader loop what
//! to do with it (deliver it, resolve a pending correlation, answer a ping...).
//!
//! Notes on fields:
//! - `id`: opaque id used to correlate acknowledgments and responses; the
//!   sender generates one when acknowledgment or a response is expected
//! - `target`: queue name for queue messages, binding name for router
//!   messages, client id for responses
//! - `payload`: raw bytes; size limits apply to its length
//! - `delivery_count`: incremented by the delivery handler on every send
//!   attempt and persisted so it survives a restart
//! - `code`: outcome carried by acknowledge/response frames

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header names with a meaning to the broker.
pub mod headers {
    /// Target queue for router messages handled by an auto-queue binding.
    pub const QUEUE_NAME: &str = "Queue-Name";
    /// Carbon copy target list, transport-only.
    pub const CC: &str = "CC";
    /// Reason text attached to a negative acknowledgment.
    pub const NEGATIVE_ACKNOWLEDGE_REASON: &str = "Negative-Acknowledge-Reason";
    /// Client display name sent with the hello frame.
    pub const CLIENT_NAME: &str = "Client-Name";
}

/// Content types of `Server` frames.
pub mod content_types {
    pub const HELLO: u16 = 101;
    pub const ACCEPTED: u16 = 102;
    pub const SUBSCRIBE: u16 = 601;
    pub const UNSUBSCRIBE: u16 = 602;
    pub const CREATE_QUEUE: u16 = 610;
    pub const REMOVE_QUEUE: u16 = 611;
    pub const UPDATE_QUEUE: u16 = 612;
    pub const CLEAR_MESSAGES: u16 = 613;
    pub const QUEUE_LIST: u16 = 614;
    pub const QUEUE_STATUS: u16 = 615;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Server,
    QueueMessage,
    Router,
    Acknowledge,
    Response,
    Ping,
    Pong,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    #[default]
    Ok,
    NoContent,
    Failed,
    BadRequest,
    Unauthorized,
    NotFound,
    Duplicate,
    LimitExceeded,
    StatusNotSupported,
    InternalServerError,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Ok | ResultCode::NoContent)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    #[serde(default)]
    pub acknowledge_required: bool,
    #[serde(default)]
    pub response_required: bool,
    /// Deliver to a single subscriber only.
    #[serde(default)]
    pub first_acquirer: bool,
    /// Enqueue into the priority sequence.
    #[serde(default)]
    pub high_priority: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub content_type: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub payload: Bytes,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default)]
    pub code: ResultCode,
    /// Milliseconds since UNIX epoch, set on creation.
    #[serde(default)]
    pub timestamp: i64,
}

/// Generates a fresh message id.
pub fn next_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(kind: MessageKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            id: String::new(),
            target: target.into(),
            content_type: 0,
            source: None,
            headers: Vec::new(),
            payload: Bytes::new(),
            flags: MessageFlags::default(),
            ttl_ms: None,
            delivery_count: 0,
            code: ResultCode::Ok,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A queue message carrying `payload`, addressed to `queue`.
    pub fn queue_message(queue: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let mut msg = Self::new(MessageKind::QueueMessage, queue);
        msg.payload = payload.into();
        msg
    }

    /// A server control frame (subscribe, create queue, ...).
    pub fn server(content_type: u16, target: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Server, target);
        msg.content_type = content_type;
        msg
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, "")
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, "")
    }

    /// Header lookup, names compare case-insensitively.
    pub fn find_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_headers(&mut self, names: &[&str]) {
        self.headers
            .retain(|(k, _)| !names.iter().any(|n| k.eq_ignore_ascii_case(n)));
    }

    pub fn set_string_content(&mut self, content: impl Into<String>) {
        self.payload = Bytes::from(content.into());
    }

    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Positive acknowledgment for this message.
    pub fn create_acknowledge(&self) -> Message {
        let mut ack = Message::new(MessageKind::Acknowledge, self.target.clone());
        ack.id = self.id.clone();
        ack.content_type = self.content_type;
        ack
    }

    /// Negative acknowledgment; `reason` travels in a header.
    pub fn create_negative_acknowledge(&self, reason: &str) -> Message {
        let mut ack = self.create_acknowledge();
        ack.code = ResultCode::Failed;
        ack.set_header(headers::NEGATIVE_ACKNOWLEDGE_REASON, reason);
        ack
    }

    /// Response addressed back to the sender of this message.
    pub fn create_response(&self, code: ResultCode) -> Message {
        let target = self.source.clone().unwrap_or_else(|| self.target.clone());
        let mut response = Message::new(MessageKind::Response, target);
        response.id = self.id.clone();
        response.content_type = self.content_type;
        response.code = code;
        response
    }

    /// Copy with a new id and a reset delivery count. Headers and payload are kept.
    pub fn clone_as(&self, id: impl Into<String>) -> Message {
        let mut copy = self.clone();
        copy.id = id.into();
        copy.delivery_count = 0;
        copy.timestamp = chrono::Utc::now().timestamp_millis();
        copy
    }

    /// True when this ack/response reports a failure.
    pub fn is_negative(&self) -> bool {
        !self.code.is_success()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);
                self.timestamp.saturating_add(ttl) <= now_ms
            }
            None => false,
        }
    }
}
