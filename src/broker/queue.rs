//! Queue
//!
//! A queue owns the pending messages of one destination and the set of
//! subscribed connections. Pushes are checked against status and size limit,
//! then either broadcast straight to the subscribers (no acknowledgment) or
//! enqueued and drained through the `DeliveryHandler`.
//!
//! Locking:
//! - `pending` guards both sequences; it is never held while sending
//! - `clients` holds an `Arc` snapshot; fan-out clones the `Arc` and iterates
//!   without a lock, mutation replaces the whole vector
//! - one drain runs at a time; callers that find a drain in progress leave a
//!   wake-up flag and return

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::codec;
use crate::broker::delivery::{AckOutcome, Decision, DeliveryHandler};
use crate::broker::hooks::HookRegistry;
use crate::broker::ledger::RedeliveryLedger;
use crate::broker::message::{Message, ResultCode, headers, next_message_id};
use crate::broker::options::{DeleteWhen, ProducerAck, QueueOptions, QueueStatus};
use crate::persistence::{Persistence, QueueDefinition};
use crate::transport::Connection;
use crate::utils::error::{ErrorSink, TracingErrorSink, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Success,
    /// The queue is paused or stopped.
    StatusNotSupported,
    /// The payload is larger than the queue accepts.
    LimitExceeded,
    /// The message could not be encoded or stored.
    Error,
}

impl PushResult {
    pub fn code(self) -> ResultCode {
        match self {
            PushResult::Success => ResultCode::Ok,
            PushResult::StatusNotSupported => ResultCode::StatusNotSupported,
            PushResult::LimitExceeded => ResultCode::LimitExceeded,
            PushResult::Error => ResultCode::InternalServerError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionResult {
    Success,
    /// A subscription hook vetoed the client.
    Unauthorized,
    /// The queue reached its client limit.
    Full,
}

impl SubscriptionResult {
    pub fn code(self) -> ResultCode {
        match self {
            SubscriptionResult::Success => ResultCode::Ok,
            SubscriptionResult::Unauthorized => ResultCode::Unauthorized,
            SubscriptionResult::Full => ResultCode::LimitExceeded,
        }
    }
}

/// A message owned by a queue together with where it came from.
#[derive(Clone)]
pub struct QueueMessage {
    pub message: Message,
    pub producer: Option<Arc<dyn Connection>>,
    /// The producer asked to be acknowledged.
    pub producer_ack_required: bool,
    pub enqueued_at: Instant,
}

impl QueueMessage {
    pub fn new(message: Message) -> Self {
        Self::from_producer(message, None)
    }

    pub fn from_producer(message: Message, producer: Option<Arc<dyn Connection>>) -> Self {
        let producer_ack_required = message.flags.acknowledge_required;
        Self {
            message,
            producer,
            producer_ack_required,
            enqueued_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("message", &self.message)
            .field("producer", &self.producer.as_ref().map(|p| p.id().to_string()))
            .field("producer_ack_required", &self.producer_ack_required)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub status: QueueStatus,
    pub priority_messages: usize,
    pub normal_messages: usize,
    pub in_flight: usize,
    pub subscribers: usize,
    pub options: QueueOptions,
}

#[derive(Debug, Default)]
struct PendingMessages {
    priority: VecDeque<QueueMessage>,
    normal: VecDeque<QueueMessage>,
}

impl PendingMessages {
    fn push_back(&mut self, entry: QueueMessage) {
        if entry.message.flags.high_priority {
            self.priority.push_back(entry);
        } else {
            self.normal.push_back(entry);
        }
    }

    fn push_front(&mut self, entry: QueueMessage) {
        if entry.message.flags.high_priority {
            self.priority.push_front(entry);
        } else {
            self.normal.push_front(entry);
        }
    }

    fn pop_front(&mut self) -> Option<QueueMessage> {
        self.priority
            .pop_front()
            .or_else(|| self.normal.pop_front())
    }

    fn take_where(&mut self, mut pred: impl FnMut(&QueueMessage) -> bool) -> Vec<QueueMessage> {
        let mut taken = Vec::new();
        for seq in [&mut self.priority, &mut self.normal] {
            let mut kept = VecDeque::with_capacity(seq.len());
            for entry in seq.drain(..) {
                if pred(&entry) {
                    taken.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *seq = kept;
        }
        taken
    }

    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

/// Collaborators a queue is built with.
pub struct QueueParts {
    pub status: QueueStatus,
    pub ledger: RedeliveryLedger,
    pub hooks: Arc<HookRegistry>,
    pub store: Option<Persistence>,
    pub errors: Arc<dyn ErrorSink>,
}

impl Default for QueueParts {
    fn default() -> Self {
        Self {
            status: QueueStatus::Running,
            ledger: RedeliveryLedger::in_memory(),
            hooks: Arc::new(HookRegistry::new()),
            store: None,
            errors: Arc::new(TracingErrorSink),
        }
    }
}

pub struct Queue {
    name: String,
    status: RwLock<QueueStatus>,
    options: RwLock<QueueOptions>,
    pending: Mutex<PendingMessages>,
    clients: RwLock<Arc<Vec<Arc<dyn Connection>>>>,
    hooks: Arc<HookRegistry>,
    delivery: DeliveryHandler,
    store: Option<Persistence>,
    errors: Arc<dyn ErrorSink>,
    cursor: AtomicUsize,
    drain_lock: Mutex<()>,
    wake: AtomicBool,
}

impl Queue {
    /// In-memory queue with no hooks.
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self::with_parts(name, options, QueueParts::default())
    }

    pub fn with_parts(name: impl Into<String>, options: QueueOptions, parts: QueueParts) -> Self {
        let delivery = DeliveryHandler::new(&options, parts.ledger, parts.errors.clone());
        Self {
            name: name.into(),
            status: RwLock::new(parts.status),
            options: RwLock::new(options),
            pending: Mutex::new(PendingMessages::default()),
            clients: RwLock::new(Arc::new(Vec::new())),
            hooks: parts.hooks,
            delivery,
            store: parts.store,
            errors: parts.errors,
            cursor: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            wake: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.read()
    }

    pub fn options(&self) -> QueueOptions {
        self.options.read().clone()
    }

    pub fn delivery(&self) -> &DeliveryHandler {
        &self.delivery
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn set_status(&self, status: QueueStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            info!(queue = %self.name, ?previous, ?status, "queue status changed");
            self.persist_definition();
        }
        if status == QueueStatus::Running {
            self.trigger();
        }
    }

    /// Replaces the options. Takes effect for the next push and the next
    /// delivery decision.
    pub fn set_options(&self, options: QueueOptions) {
        self.delivery.set_policy(&options);
        *self.options.write() = options;
        self.persist_definition();
        self.trigger();
    }

    pub fn definition(&self) -> QueueDefinition {
        QueueDefinition {
            name: self.name.clone(),
            status: self.status(),
            options: self.options(),
        }
    }

    pub fn persist_definition(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_queue(&self.definition()) {
                self.errors.report("SAVE_QUEUE", &self.name, &e);
            }
        }
    }

    pub fn info(&self) -> QueueInfo {
        let (priority_messages, normal_messages) = {
            let pending = self.pending.lock();
            (pending.priority.len(), pending.normal.len())
        };
        QueueInfo {
            name: self.name.clone(),
            status: self.status(),
            priority_messages,
            normal_messages,
            in_flight: self.delivery.in_flight(),
            subscribers: self.clients.read().len(),
            options: self.options(),
        }
    }

    pub fn priority_len(&self) -> usize {
        self.pending.lock().priority.len()
    }

    pub fn normal_len(&self) -> usize {
        self.pending.lock().normal.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pending messages in delivery order.
    pub fn pending_messages(&self) -> Vec<Message> {
        let pending = self.pending.lock();
        pending
            .priority
            .iter()
            .chain(pending.normal.iter())
            .map(|e| e.message.clone())
            .collect()
    }

    /// No subscribers, nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.clients.read().is_empty() && self.pending_len() == 0 && self.delivery.in_flight() == 0
    }

    pub fn push(&self, mut entry: QueueMessage) -> PushResult {
        let status = self.status();
        if status != QueueStatus::Running {
            debug!(queue = %self.name, ?status, "push rejected by status");
            return PushResult::StatusNotSupported;
        }

        let options = self.options();
        if options.message_size_limit > 0 && entry.message.len() > options.message_size_limit {
            debug!(
                queue = %self.name,
                size = entry.message.len(),
                limit = options.message_size_limit,
                "push rejected by size limit"
            );
            return PushResult::LimitExceeded;
        }

        let message = &mut entry.message;
        message.remove_headers(&[headers::QUEUE_NAME, headers::CC]);
        message.target = self.name.clone();
        if message.id.is_empty() {
            message.id = next_message_id();
        }

        if options.is_tracked() {
            self.push_tracked(entry, &options)
        } else {
            self.broadcast(entry, &options)
        }
    }

    fn broadcast(&self, mut entry: QueueMessage, options: &QueueOptions) -> PushResult {
        entry.message.flags.acknowledge_required = false;
        entry.message.flags.response_required = false;

        let frame = match codec::encode(&entry.message) {
            Ok(frame) => frame,
            Err(e) => {
                self.errors.report("PUSH", &self.context(&entry.message.id), &e);
                return PushResult::Error;
            }
        };

        let clients = self.connected_clients();
        let targets = self.select_targets(&clients, options, &entry.message);
        for client in &targets {
            if let Err(e) = client.send(frame.clone()) {
                self.errors.report("PUSH", &self.client_context(client.id()), &e);
            }
        }
        debug!(queue = %self.name, message_id = %entry.message.id, receivers = targets.len(), "broadcast");

        if options.producer_ack != ProducerAck::None {
            self.notify_producer(&entry, None);
        }
        PushResult::Success
    }

    fn push_tracked(&self, entry: QueueMessage, options: &QueueOptions) -> PushResult {
        if let Err(e) = codec::encode(&entry.message) {
            self.errors.report("PUSH", &self.context(&entry.message.id), &e);
            return PushResult::Error;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.store_message(&self.name, &entry.message) {
                self.errors.report("PUSH", &self.context(&entry.message.id), &e);
                return PushResult::Error;
            }
        }

        if options.producer_ack == ProducerAck::AfterReceived {
            self.notify_producer(&entry, None);
        }
        self.pending.lock().push_back(entry);
        self.trigger();
        PushResult::Success
    }

    /// Sends pending messages while the queue is running and has connected
    /// subscribers. Returns the number of messages handed out.
    pub fn trigger(&self) -> usize {
        self.wake.store(true, Ordering::SeqCst);
        let mut sent = 0;
        loop {
            let Some(guard) = self.drain_lock.try_lock() else {
                return sent;
            };
            while self.wake.swap(false, Ordering::SeqCst) {
                sent += self.drain();
            }
            drop(guard);
            if !self.wake.load(Ordering::SeqCst) {
                return sent;
            }
        }
    }

    fn drain(&self) -> usize {
        let mut sent = 0;
        loop {
            if self.status() != QueueStatus::Running {
                break;
            }
            let clients = self.connected_clients();
            if clients.is_empty() {
                break;
            }
            let Some(mut entry) = self.pending.lock().pop_front() else {
                break;
            };

            let options = self.options();
            let targets = self.select_targets(&clients, &options, &entry.message);
            let ids = targets.iter().map(|c| c.id().to_string());
            if let Err(e) = self.delivery.begin_send(&mut entry, ids, Instant::now()) {
                self.errors.report("BEGIN_SEND", &self.context(entry.id()), &e);
                self.pending.lock().push_front(entry);
                break;
            }

            let mut outgoing = entry.message.clone();
            outgoing.flags.acknowledge_required = true;
            let frame = match codec::encode(&outgoing) {
                Ok(frame) => frame,
                Err(e) => {
                    self.errors.report("SEND", &self.context(entry.id()), &e);
                    self.delivery.forget(entry.id());
                    self.remove_stored(entry.id());
                    continue;
                }
            };
            if options.delete_when == DeleteWhen::AfterSend {
                self.remove_stored(entry.id());
            }

            for client in &targets {
                if let Err(e) = client.send(frame.clone()) {
                    self.errors.report("SEND", &self.client_context(client.id()), &e);
                }
            }
            debug!(
                queue = %self.name,
                message_id = %entry.message.id,
                delivery_count = entry.message.delivery_count,
                receivers = targets.len(),
                "delivered"
            );
            sent += 1;
        }
        sent
    }

    fn connected_clients(&self) -> Vec<Arc<dyn Connection>> {
        let snapshot = self.clients.read().clone();
        snapshot
            .iter()
            .filter(|c| c.is_connected())
            .cloned()
            .collect()
    }

    fn select_targets(
        &self,
        clients: &[Arc<dyn Connection>],
        options: &QueueOptions,
        message: &Message,
    ) -> Vec<Arc<dyn Connection>> {
        if clients.is_empty() {
            return Vec::new();
        }
        if options.send_only_first_acquirer || message.flags.first_acquirer {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % clients.len();
            vec![clients[index].clone()]
        } else {
            clients.to_vec()
        }
    }

    /// Applies an acknowledgment frame sent by `client_id`. Returns false when
    /// nothing was waiting for it.
    pub fn acknowledge(&self, ack: &Message, client_id: &str) -> bool {
        let positive = !ack.is_negative();
        match self.delivery.acknowledge(&ack.id, client_id, positive) {
            AckOutcome::Completed(entry) => {
                let options = self.options();
                if options.delete_when == DeleteWhen::AfterAcknowledge {
                    self.remove_stored(entry.id());
                }
                if options.producer_ack == ProducerAck::AfterConsumerAck {
                    self.notify_producer(&entry, None);
                }
                debug!(queue = %self.name, message_id = %ack.id, client = client_id, "acknowledged");
                true
            }
            AckOutcome::Pending => true,
            AckOutcome::Failed(decision) => {
                warn!(
                    queue = %self.name,
                    message_id = %ack.id,
                    client = client_id,
                    reason = ack.find_header(headers::NEGATIVE_ACKNOWLEDGE_REASON).unwrap_or(""),
                    "negative acknowledgment"
                );
                self.apply(decision);
                self.trigger();
                true
            }
            AckOutcome::Unknown => {
                debug!(queue = %self.name, message_id = %ack.id, client = client_id, "acknowledgment for unknown delivery");
                false
            }
        }
    }

    /// Settles expired deliveries and drops pending messages past their
    /// message timeout or TTL. Returns the number of messages settled.
    pub fn sweep(&self, now: Instant) -> usize {
        let decisions = self.delivery.sweep(now);
        let settled = decisions.len();
        for decision in decisions {
            self.apply(decision);
        }
        settled + self.expire_pending(now)
    }

    fn expire_pending(&self, now: Instant) -> usize {
        let timeout = self.options.read().message_timeout();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let expired = self.pending.lock().take_where(|entry| {
            timeout.is_some_and(|t| entry.enqueued_at + t <= now) || entry.message.is_expired(now_ms)
        });
        for entry in &expired {
            info!(queue = %self.name, message_id = %entry.message.id, "pending message expired");
            self.remove_stored(entry.id());
            self.delivery.forget_count(entry.id());
        }
        expired.len()
    }

    fn apply(&self, decision: Decision) {
        match decision {
            Decision::PutBack(entry) => {
                debug!(
                    queue = %self.name,
                    message_id = %entry.message.id,
                    delivery_count = entry.message.delivery_count,
                    "put back"
                );
                self.pending.lock().push_back(entry);
            }
            Decision::Discard(entry) => {
                info!(
                    queue = %self.name,
                    message_id = %entry.message.id,
                    delivery_count = entry.message.delivery_count,
                    "discarded"
                );
                self.remove_stored(entry.id());
                if self.options.read().producer_ack == ProducerAck::AfterConsumerAck {
                    self.notify_producer(&entry, Some("delivery failed"));
                }
            }
        }
    }

    pub fn add_client(&self, client: Arc<dyn Connection>) -> SubscriptionResult {
        if !self.hooks.can_subscribe(self, client.as_ref()) {
            return SubscriptionResult::Unauthorized;
        }

        {
            let mut clients = self.clients.write();
            if clients.iter().any(|c| c.id() == client.id()) {
                return SubscriptionResult::Success;
            }
            let limit = self.options.read().client_limit;
            if limit > 0 && clients.len() >= limit {
                return SubscriptionResult::Full;
            }
            let mut next = clients.as_ref().clone();
            next.push(client.clone());
            *clients = Arc::new(next);
        }

        info!(queue = %self.name, client = client.id(), "subscribed");
        self.hooks.on_subscribe(self, client.as_ref());
        self.trigger();
        SubscriptionResult::Success
    }

    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = {
            let mut clients = self.clients.write();
            if !clients.iter().any(|c| c.id() == client_id) {
                false
            } else {
                let next: Vec<_> = clients
                    .iter()
                    .filter(|c| c.id() != client_id)
                    .cloned()
                    .collect();
                *clients = Arc::new(next);
                true
            }
        };
        if removed {
            info!(queue = %self.name, client = client_id, "unsubscribed");
            self.hooks.on_unsubscribe(self, client_id);
        }
        removed
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.read().iter().any(|c| c.id() == client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Removes pending messages from the selected sequences.
    pub fn clear_messages(&self, priority: bool, normal: bool) -> usize {
        let removed: Vec<QueueMessage> = {
            let mut pending = self.pending.lock();
            let mut removed = Vec::new();
            if priority {
                removed.extend(pending.priority.drain(..));
            }
            if normal {
                removed.extend(pending.normal.drain(..));
            }
            removed
        };
        for entry in &removed {
            self.remove_stored(entry.id());
            self.delivery.forget_count(entry.id());
        }
        if !removed.is_empty() {
            info!(queue = %self.name, count = removed.len(), priority, normal, "messages cleared");
        }
        removed.len()
    }

    /// Removes a message whether it is pending or in flight.
    pub fn remove_message(&self, id: &str) -> bool {
        let pending = self.pending.lock().take_where(|e| e.message.id == id);
        let in_flight = self.delivery.forget(id);
        let found = !pending.is_empty() || in_flight.is_some();
        if found {
            self.remove_stored(id);
            if in_flight.is_none() {
                self.delivery.forget_count(id);
            }
        }
        found
    }

    /// Deletes acknowledged messages held for commit.
    pub fn commit(&self) -> usize {
        let committed = self.delivery.commit();
        for entry in &committed {
            self.remove_stored(entry.id());
        }
        committed.len()
    }

    /// Re-enqueues stored messages after a restart, carrying over the
    /// delivery counts already in the ledger.
    pub fn restore(&self, messages: Vec<Message>) -> usize {
        let mut pending = self.pending.lock();
        let count = messages.len();
        for mut message in messages {
            if let Some(delivered) = self.delivery.delivery_count(&message.id) {
                message.delivery_count = delivered;
            }
            let mut entry = QueueMessage::new(message);
            entry.producer_ack_required = false;
            pending.push_back(entry);
        }
        count
    }

    /// Settles every open delivery and releases the ledger.
    /// Stops accepting pushes and settles every open record. The stored
    /// definition keeps its status so a restart resumes the queue.
    pub fn shutdown(&self) {
        *self.status.write() = QueueStatus::Stopped;
        for decision in self.delivery.drain() {
            self.apply(decision);
        }
        if let Err(e) = self.delivery.close() {
            self.errors.report("SHUTDOWN", &self.name, &e);
        }
    }

    fn remove_stored(&self, id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_message(&self.name, id) {
                self.errors.report("REMOVE_MESSAGE", &self.context(id), &e);
            }
        }
    }

    fn notify_producer(&self, entry: &QueueMessage, failure: Option<&str>) {
        if !entry.producer_ack_required {
            return;
        }
        let Some(producer) = &entry.producer else {
            return;
        };
        let ack = match failure {
            None => entry.message.create_acknowledge(),
            Some(reason) => entry.message.create_negative_acknowledge(reason),
        };
        let result = codec::encode(&ack)
            .map_err(TransportError::from)
            .and_then(|frame| producer.send(frame));
        if let Err(e) = result {
            self.errors
                .report("PRODUCER_ACK", &self.client_context(producer.id()), &e);
        }
    }

    fn context(&self, message_id: &str) -> String {
        format!("queue={} message={}", self.name, message_id)
    }

    fn client_context(&self, client_id: &str) -> String {
        format!("queue={} client={}", self.name, client_id)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("pending", &self.pending_len())
            .field("delivery", &self.delivery)
            .finish()
    }
}
