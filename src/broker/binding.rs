//! Auto-queue binding
//!
//! Routes router messages into a queue named by the message's `Queue-Name`
//! header, creating the queue with the broker's default options when it does
//! not exist yet.
//!
//! The first resolved queue is cached for the lifetime of the binding. If that
//! queue is later deleted the binding keeps pushing into the detached
//! instance; remove and re-add the binding after deleting its queue.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::engine::Broker;
use crate::broker::message::{Message, MessageKind, headers, next_message_id};
use crate::broker::queue::{PushResult, Queue, QueueMessage};
use crate::transport::Connection;
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingInteraction {
    /// The producer expects nothing back. The routed copy gets a fresh id.
    #[default]
    None,
    /// The producer is acknowledged under its own message id.
    Acknowledge,
    /// The consumer's response goes back to the producer under its own id.
    Response,
}

pub struct AutoQueueBinding {
    name: String,
    interaction: BindingInteraction,
    target_queue: Mutex<Option<Arc<Queue>>>,
}

impl AutoQueueBinding {
    pub fn new(name: impl Into<String>, interaction: BindingInteraction) -> Self {
        Self {
            name: name.into(),
            interaction,
            target_queue: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interaction(&self) -> BindingInteraction {
        self.interaction
    }

    /// Pushes a copy of `message` into the target queue. Returns true when the
    /// queue accepted it.
    pub fn send(
        &self,
        broker: &Broker,
        sender: Option<Arc<dyn Connection>>,
        message: &Message,
    ) -> bool {
        let queue = match self.resolve_queue(broker, message) {
            Ok(Some(queue)) => queue,
            Ok(None) => {
                debug!(binding = %self.name, message_id = %message.id, "no queue name header");
                return false;
            }
            Err(e) => {
                broker.errors().report(
                    "BINDING_SEND",
                    &format!("type=auto_queue binding={}", self.name),
                    &e,
                );
                return false;
            }
        };

        let id = match self.interaction {
            BindingInteraction::None => next_message_id(),
            BindingInteraction::Acknowledge | BindingInteraction::Response => message.id.clone(),
        };
        let mut routed = message.clone_as(id);
        routed.kind = MessageKind::QueueMessage;
        routed.target = queue.name().to_string();
        routed.flags.acknowledge_required = self.interaction == BindingInteraction::Acknowledge;
        routed.flags.response_required = self.interaction == BindingInteraction::Response;

        queue.push(QueueMessage::from_producer(routed, sender)) == PushResult::Success
    }

    pub fn cached_queue(&self) -> Option<Arc<Queue>> {
        self.target_queue.lock().clone()
    }

    fn resolve_queue(
        &self,
        broker: &Broker,
        message: &Message,
    ) -> Result<Option<Arc<Queue>>, BrokerError> {
        let mut cached = self.target_queue.lock();
        if let Some(queue) = cached.as_ref() {
            return Ok(Some(queue.clone()));
        }

        let Some(queue_name) = message.find_header(headers::QUEUE_NAME) else {
            return Ok(None);
        };
        let queue = broker.get_or_create_queue(queue_name, None)?;
        *cached = Some(queue.clone());
        Ok(Some(queue))
    }
}

impl std::fmt::Debug for AutoQueueBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoQueueBinding")
            .field("name", &self.name)
            .field("interaction", &self.interaction)
            .field(
                "target_queue",
                &self.target_queue.lock().as_ref().map(|q| q.name().to_string()),
            )
            .finish()
    }
}
