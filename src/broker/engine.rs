//! Broker engine
//!
//! The broker owns every queue, every connected client and the router
//! bindings. It is shared as `Arc<Broker>`; all state lives behind concurrent
//! maps and per-queue locks, so transport tasks call into it without a global
//! lock.
//!
//! Concurrency and usage notes:
//! - queue names are case-insensitive; maps are keyed by the lowercase name
//! - no map guard is held while calling into a queue, so queue code may call
//!   back into the broker (bindings, auto-destroy)
//! - the redelivery sweeper is one background task for all queues, started
//!   with `start_retry_loop` and stopped by `shutdown`

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::binding::AutoQueueBinding;
use crate::broker::codec;
use crate::broker::hooks::{HookRegistry, SubscriptionHook};
use crate::broker::ledger::RedeliveryLedger;
use crate::broker::message::Message;
use crate::broker::options::{QueueOptions, QueueStatus};
use crate::broker::queue::{PushResult, Queue, QueueInfo, QueueMessage, QueueParts, SubscriptionResult};
use crate::persistence::Persistence;
use crate::transport::Connection;
use crate::utils::error::{BrokerError, ErrorSink, TracingErrorSink, TransportError};

const MAX_QUEUE_NAME_LEN: usize = 256;

pub struct Broker {
    queues: DashMap<String, Arc<Queue>>,
    clients: DashMap<String, Arc<dyn Connection>>,
    bindings: DashMap<String, Arc<AutoQueueBinding>>,
    hooks: Arc<HookRegistry>,
    default_options: RwLock<QueueOptions>,
    persistence: Option<Persistence>,
    errors: Arc<dyn ErrorSink>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// In-memory broker. Queues it creates keep their ledgers in memory.
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queues: DashMap::new(),
            clients: DashMap::new(),
            bindings: DashMap::new(),
            hooks: Arc::new(HookRegistry::new()),
            default_options: RwLock::new(QueueOptions::default()),
            persistence: None,
            errors: Arc::new(TracingErrorSink),
            shutdown_tx,
        }
    }

    /// Queues created from now on are persistent and their ledgers live in
    /// the same sled database.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_default_options(self, options: QueueOptions) -> Self {
        *self.default_options.write() = options;
        self
    }

    pub fn errors(&self) -> &dyn ErrorSink {
        self.errors.as_ref()
    }

    pub fn default_options(&self) -> QueueOptions {
        self.default_options.read().clone()
    }

    pub fn set_default_options(&self, options: QueueOptions) {
        *self.default_options.write() = options;
    }

    pub fn add_hook(&self, hook: Arc<dyn SubscriptionHook>) {
        self.hooks.add(hook);
    }

    pub fn register_client(&self, client: Arc<dyn Connection>) {
        debug!(client = client.id(), "client registered");
        self.clients.insert(client.id().to_string(), client);
    }

    pub fn remove_client(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        self.clients.remove(client_id).map(|(_, c)| c)
    }

    pub fn find_client(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        self.clients.get(client_id).map(|c| c.value().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Removes a client and unsubscribes it from every queue.
    pub fn cleanup_client(&self, client_id: &str) {
        self.remove_client(client_id);
        for queue in self.queue_snapshot() {
            if queue.remove_client(client_id) {
                debug!(client = client_id, queue = queue.name(), "unsubscribed on cleanup");
                self.destroy_if_idle(&queue);
            }
        }
        info!(client = client_id, "cleaned up client");
    }

    pub fn create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> Result<Arc<Queue>, BrokerError> {
        validate_queue_name(name)?;
        match self.queues.entry(queue_key(name)) {
            Entry::Occupied(_) => Err(BrokerError::QueueExists(name.to_string())),
            Entry::Vacant(slot) => {
                let options = options.unwrap_or_else(|| self.default_options());
                let queue = self.build_queue(name, options, QueueStatus::Running)?;
                queue.persist_definition();
                slot.insert(queue.clone());
                info!(queue = name, "queue created");
                Ok(queue)
            }
        }
    }

    pub fn get_or_create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> Result<Arc<Queue>, BrokerError> {
        validate_queue_name(name)?;
        match self.queues.entry(queue_key(name)) {
            Entry::Occupied(slot) => Ok(slot.get().clone()),
            Entry::Vacant(slot) => {
                let options = options.unwrap_or_else(|| self.default_options());
                let queue = self.build_queue(name, options, QueueStatus::Running)?;
                queue.persist_definition();
                slot.insert(queue.clone());
                info!(queue = name, "queue created on demand");
                Ok(queue)
            }
        }
    }

    fn build_queue(
        &self,
        name: &str,
        options: QueueOptions,
        status: QueueStatus,
    ) -> Result<Arc<Queue>, BrokerError> {
        let ledger = match &self.persistence {
            Some(persistence) => RedeliveryLedger::new(persistence.delivery_store(name)?),
            None => RedeliveryLedger::in_memory(),
        };
        let parts = QueueParts {
            status,
            ledger,
            hooks: self.hooks.clone(),
            store: self.persistence.clone(),
            errors: self.errors.clone(),
        };
        Ok(Arc::new(Queue::with_parts(name, options, parts)))
    }

    pub fn find_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(&queue_key(name)).map(|q| q.value().clone())
    }

    /// Removes the queue with everything it holds, persisted state included.
    pub fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let Some((_, queue)) = self.queues.remove(&queue_key(name)) else {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        };
        queue.clear_messages(true, true);
        queue.shutdown();
        if let Some(persistence) = &self.persistence {
            persistence.remove_queue(name)?;
        }
        info!(queue = name, "queue deleted");
        Ok(())
    }

    /// Queue summaries ordered by name.
    pub fn list_queues(&self) -> Vec<QueueInfo> {
        let mut infos: Vec<_> = self.queue_snapshot().iter().map(|q| q.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn queue_snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }

    /// Subscribes `client` to `queue`, creating the queue with default
    /// options when it does not exist.
    pub fn subscribe(
        &self,
        queue: &str,
        client: Arc<dyn Connection>,
    ) -> Result<SubscriptionResult, BrokerError> {
        let queue = self.get_or_create_queue(queue, None)?;
        Ok(queue.add_client(client))
    }

    pub fn unsubscribe(&self, queue: &str, client_id: &str) -> bool {
        let Some(queue) = self.find_queue(queue) else {
            return false;
        };
        let removed = queue.remove_client(client_id);
        if removed {
            self.destroy_if_idle(&queue);
        }
        removed
    }

    fn destroy_if_idle(&self, queue: &Queue) {
        if !queue.options().auto_destroy || !queue.is_idle() {
            return;
        }
        match self.delete_queue(queue.name()) {
            Ok(()) => info!(queue = queue.name(), "idle queue destroyed"),
            Err(BrokerError::QueueNotFound(_)) => {}
            Err(e) => self.errors.report("AUTO_DESTROY", queue.name(), &e),
        }
    }

    /// Pushes a queue message into the queue named by its target.
    pub fn push(
        &self,
        message: Message,
        producer: Option<Arc<dyn Connection>>,
    ) -> Result<PushResult, BrokerError> {
        let queue = self
            .find_queue(&message.target)
            .ok_or_else(|| BrokerError::QueueNotFound(message.target.clone()))?;
        Ok(queue.push(QueueMessage::from_producer(message, producer)))
    }

    /// Hands an acknowledgment from `client_id` to the queue it targets.
    pub fn acknowledge(&self, ack: &Message, client_id: &str) -> bool {
        match self.find_queue(&ack.target) {
            Some(queue) => queue.acknowledge(ack, client_id),
            None => {
                debug!(queue = %ack.target, message_id = %ack.id, "acknowledgment for unknown queue");
                false
            }
        }
    }

    pub fn add_binding(&self, binding: AutoQueueBinding) -> Arc<AutoQueueBinding> {
        let binding = Arc::new(binding);
        self.bindings
            .insert(binding.name().to_lowercase(), binding.clone());
        binding
    }

    pub fn remove_binding(&self, name: &str) -> bool {
        self.bindings.remove(&name.to_lowercase()).is_some()
    }

    /// Sends a router message through the binding named by its target.
    pub fn route(&self, message: &Message, sender: Option<Arc<dyn Connection>>) -> bool {
        let binding = self
            .bindings
            .get(&message.target.to_lowercase())
            .map(|b| b.value().clone());
        match binding {
            Some(binding) => binding.send(self, sender, message),
            None => {
                debug!(router = %message.target, "no binding for router message");
                false
            }
        }
    }

    /// Delivers a frame to the client with the given id.
    pub fn send_to_client(&self, client_id: &str, message: &Message) -> Result<(), TransportError> {
        let client = self
            .find_client(client_id)
            .ok_or_else(|| TransportError::Closed(client_id.to_string()))?;
        client.send(codec::encode(message)?)
    }

    /// Forwards a consumer's response to the client it is addressed to.
    pub fn forward_response(&self, response: &Message) -> bool {
        match self.send_to_client(&response.target, response) {
            Ok(()) => true,
            Err(e) => {
                self.errors
                    .report("RESPONSE", &format!("client={}", response.target), &e);
                false
            }
        }
    }

    /// Restores persistent queues: definitions first, then each queue's
    /// ledger, then its stored messages with the ledger's delivery counts.
    pub fn load_persistent_queues(&self) -> Result<usize, BrokerError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };

        let mut restored = 0;
        for definition in persistence.load_queues()? {
            if self.find_queue(&definition.name).is_some() {
                warn!(queue = %definition.name, "persistent queue already loaded");
                continue;
            }
            let queue = self.build_queue(&definition.name, definition.options, definition.status)?;
            let deliveries = queue.delivery().load()?;
            let messages = queue.restore(persistence.load_messages(&definition.name)?);
            self.queues.insert(queue_key(&definition.name), queue);
            info!(queue = %definition.name, messages, deliveries, "persistent queue restored");
            restored += 1;
        }
        Ok(restored)
    }

    /// Settles expired deliveries of every queue and drains what became
    /// deliverable. Returns the number of messages settled.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut settled = 0;
        for queue in self.queue_snapshot() {
            settled += queue.sweep(now);
            queue.trigger();
        }
        settled
    }

    /// Spawns the redelivery sweeper. It runs until `shutdown`.
    pub fn start_retry_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let settled = broker.sweep(Instant::now());
                        if settled > 0 {
                            debug!(settled, "redelivery sweep");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("redelivery sweeper stopped");
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stops the sweeper and settles every outstanding delivery.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for queue in self.queue_snapshot() {
            queue.shutdown();
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.flush() {
                self.errors.report("SHUTDOWN", "persistence", &e);
            }
        }
        info!("broker shut down");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queues.len())
            .field("clients", &self.clients.len())
            .field("bindings", &self.bindings.len())
            .field("persistence", &self.persistence)
            .finish()
    }
}

fn queue_key(name: &str) -> String {
    name.to_lowercase()
}

fn validate_queue_name(name: &str) -> Result<(), BrokerError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && !name.chars().any(|c| c.is_whitespace() || c == '/' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidQueueName(name.to_string()))
    }
}
