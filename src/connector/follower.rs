//! Correlation of acknowledgment and response frames.
//!
//! A caller registers the message it is about to send and gets a
//! `PendingReply`. The connection's read loop hands every acknowledgment and
//! response frame to `process_acknowledge` / `process_response`; a match
//! resolves the waiting caller. Whoever removes the entry from the map first
//! (the read loop, the deadline or a disconnect) decides the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::message::Message;
use crate::utils::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FollowKind {
    Acknowledge,
    Response,
}

type Key = (FollowKind, String);
type Resolution = Result<Message, ConnectorError>;

struct PendingCorrelation {
    token: u64,
    created_at: Instant,
    tx: oneshot::Sender<Resolution>,
}

#[derive(Clone, Default)]
pub struct MessageFollower {
    pending: Arc<DashMap<Key, PendingCorrelation>>,
    tokens: Arc<AtomicU64>,
}

impl MessageFollower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `message` for an acknowledgment. Call before sending it.
    pub fn follow_acknowledge(&self, message: &Message, timeout: Duration) -> PendingReply {
        self.follow(FollowKind::Acknowledge, &message.id, timeout)
    }

    /// Registers `message` for a response. Call before sending it.
    pub fn follow_response(&self, message: &Message, timeout: Duration) -> PendingReply {
        self.follow(FollowKind::Response, &message.id, timeout)
    }

    fn follow(&self, kind: FollowKind, id: &str, timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();
        let key = (kind, id.to_string());
        let entry = PendingCorrelation {
            token,
            created_at,
            tx,
        };
        // a second follow of the same id supersedes the first
        if let Some(previous) = self.pending.insert(key.clone(), entry) {
            let _ = previous.tx.send(Err(ConnectorError::Disconnected(id.to_string())));
        }
        PendingReply {
            pending: self.pending.clone(),
            key,
            token,
            deadline: created_at + timeout,
            rx,
        }
    }

    /// Resolves the caller waiting for this acknowledgment. Returns false
    /// when nobody was waiting.
    pub fn process_acknowledge(&self, ack: &Message) -> bool {
        self.resolve(FollowKind::Acknowledge, ack)
    }

    pub fn process_response(&self, response: &Message) -> bool {
        self.resolve(FollowKind::Response, response)
    }

    fn resolve(&self, kind: FollowKind, frame: &Message) -> bool {
        match self.pending.remove(&(kind, frame.id.clone())) {
            Some((_, entry)) => {
                debug!(
                    message_id = %frame.id,
                    ?kind,
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    "correlation resolved"
                );
                let _ = entry.tx.send(Ok(frame.clone()));
                true
            }
            None => {
                debug!(message_id = %frame.id, ?kind, "unmatched frame dropped");
                false
            }
        }
    }

    /// Fails every outstanding wait. Used when the connection goes away.
    pub fn fail_all(&self) -> usize {
        let keys: Vec<Key> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some(((_, id), entry)) = self.pending.remove(&key) {
                let _ = entry.tx.send(Err(ConnectorError::Disconnected(id)));
                failed += 1;
            }
        }
        failed
    }

    pub fn is_following(&self, kind: FollowKind, id: &str) -> bool {
        self.pending.contains_key(&(kind, id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for MessageFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFollower")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// One outstanding correlation. Dropping it without waiting cancels it.
pub struct PendingReply {
    pending: Arc<DashMap<Key, PendingCorrelation>>,
    key: Key,
    token: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.key.1
    }

    pub fn kind(&self) -> FollowKind {
        self.key.0
    }

    /// Waits for the frame or the deadline, whichever claims the entry first.
    pub async fn wait(mut self) -> Result<Message, ConnectorError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(ConnectorError::Disconnected(self.key.1.clone())),
            Err(_) => {
                if self.claim() {
                    debug!(message_id = %self.key.1, kind = ?self.key.0, "correlation timed out");
                    return Err(self.timeout_error());
                }
                // the resolver removed the entry first, its value is on the way
                match (&mut self.rx).await {
                    Ok(resolution) => resolution,
                    Err(_) => Err(ConnectorError::Disconnected(self.key.1.clone())),
                }
            }
        }
    }

    /// Removes this correlation's entry if it is still registered.
    fn claim(&self) -> bool {
        self.pending
            .remove_if(&self.key, |_, entry| entry.token == self.token)
            .is_some()
    }

    fn timeout_error(&self) -> ConnectorError {
        match self.key.0 {
            FollowKind::Acknowledge => ConnectorError::AcknowledgeTimeout(self.key.1.clone()),
            FollowKind::Response => ConnectorError::ResponseTimeout(self.key.1.clone()),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.claim();
    }
}
