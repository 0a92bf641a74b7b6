//! The `error` module defines the error types shared across `relaymq`.
//!
//! Errors are grouped by the boundary they come from: transport (a single
//! connection refused a frame), codec (a frame could not be encoded or
//! decoded), persistence (the embedded store failed), broker (a queue
//! management call was rejected) and connector (a client-side wait failed).
//!
//! It also defines `ErrorSink`, the collaborator that recovered errors are
//! reported to. Per-subscriber send failures and errors raised after a reply
//! was already committed never propagate to the caller; they end up here.

use thiserror::Error;

use crate::broker::message::ResultCode;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(String),

    #[error("send to {client} failed: {reason}")]
    SendFailed { client: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("store is closed")]
    Closed,
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' already exists")]
    QueueExists(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced to callers of the client connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("not connected")]
    NotConnected,

    #[error("acknowledgment for {0} timed out")]
    AcknowledgeTimeout(String),

    #[error("response for {0} timed out")]
    ResponseTimeout(String),

    #[error("connection closed before {0} was resolved")]
    Disconnected(String),

    #[error("{id} rejected with {code:?}: {reason}")]
    Rejected {
        id: String,
        code: ResultCode,
        reason: String,
    },

    #[error("handshake was not accepted in time")]
    Handshake,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Receives errors that were recovered locally.
///
/// `operation` names what was being done (`PUSH`, `BINDING_SEND`, ...),
/// `context` carries tags such as the queue or client involved.
pub trait ErrorSink: Send + Sync {
    fn report(&self, operation: &str, context: &str, error: &dyn std::error::Error);
}

/// Default sink, writes every report to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, operation: &str, context: &str, error: &dyn std::error::Error) {
        tracing::error!(operation, context, %error, "recovered error");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ErrorSink;
    use parking_lot::Mutex;

    /// Sink that keeps every report for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub reports: Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingSink {
        pub fn operations(&self) -> Vec<String> {
            self.reports.lock().iter().map(|r| r.0.clone()).collect()
        }

        pub fn len(&self) -> usize {
            self.reports.lock().len()
        }
    }

    impl ErrorSink for RecordingSink {
        fn report(&self, operation: &str, context: &str, error: &dyn std::error::Error) {
            self.reports
                .lock()
                .push((operation.to_string(), context.to_string(), error.to_string()));
        }
    }
}
