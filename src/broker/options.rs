//! Queue options and delivery policy knobs.
//!
//! Options are read on every push and every delivery decision, so changing
//! them through `Queue::set_options` takes effect immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Running,
    /// Rejects pushes; nothing is delivered.
    Paused,
    /// Rejects pushes; nothing is delivered. Not resumed by subscribers.
    Stopped,
}

/// Which acknowledgments complete a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckScope {
    /// Broadcast. Nothing is tracked, nothing is retained.
    #[default]
    None,
    /// The first positive acknowledgment from any targeted subscriber completes it.
    FirstAcquirer,
    /// Every targeted subscriber must acknowledge.
    EverySubscriber,
}

/// When a delivered message leaves the queue for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteWhen {
    /// As soon as it is sent. A later timeout cannot bring it back.
    AfterSend,
    /// When the acknowledgment arrives.
    #[default]
    AfterAcknowledge,
    /// Acknowledged messages are held until `Queue::commit`.
    OnCommit,
}

/// What happens to a message whose acknowledgment timed out or was negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutBackDecision {
    /// Discard it.
    No,
    /// Append it to the end of its pending sequence.
    #[default]
    Yes,
}

/// When the producer of a message receives its acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerAck {
    None,
    /// Once the queue accepted the push.
    #[default]
    AfterReceived,
    /// Once a consumer acknowledged it. Broadcast queues fall back to `AfterReceived`.
    AfterConsumerAck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub acknowledge: AckScope,
    /// Maximum payload length in bytes, 0 for unlimited.
    pub message_size_limit: usize,
    /// Maximum number of subscribers, 0 for unlimited.
    pub client_limit: usize,
    pub acknowledge_timeout_ms: u64,
    /// Pending messages older than this are dropped, 0 keeps them forever.
    pub message_timeout_ms: u64,
    pub delete_when: DeleteWhen,
    pub put_back: PutBackDecision,
    /// Attempts before a message expires. `None` never expires it.
    pub max_delivery_attempts: Option<u32>,
    pub producer_ack: ProducerAck,
    /// Send each message to one subscriber, round-robin.
    pub send_only_first_acquirer: bool,
    /// Remove the queue when its last subscriber leaves and nothing is pending.
    pub auto_destroy: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            acknowledge: AckScope::None,
            message_size_limit: 0,
            client_limit: 0,
            acknowledge_timeout_ms: 15_000,
            message_timeout_ms: 0,
            delete_when: DeleteWhen::AfterAcknowledge,
            put_back: PutBackDecision::Yes,
            max_delivery_attempts: None,
            producer_ack: ProducerAck::AfterReceived,
            send_only_first_acquirer: false,
            auto_destroy: false,
        }
    }
}

impl QueueOptions {
    pub fn acknowledge_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledge_timeout_ms)
    }

    pub fn message_timeout(&self) -> Option<Duration> {
        (self.message_timeout_ms > 0).then(|| Duration::from_millis(self.message_timeout_ms))
    }

    pub fn is_tracked(&self) -> bool {
        self.acknowledge != AckScope::None
    }
}
