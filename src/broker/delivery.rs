//! Delivery handler
//!
//! Tracks every send of an acknowledge-tracked message until it is settled:
//!
//! ```text
//! begin_send -> AwaitingAck -> Acknowledged
//!                           -> deadline / negative ack -> PutBack (count kept) | Discard
//! ```
//!
//! One `DeliveryRecord` exists per message id at a time. Records are not
//! timed individually; the queue sweeper calls `sweep(now)` and every record
//! whose deadline has passed is settled in that pass.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::broker::ledger::RedeliveryLedger;
use crate::broker::options::{AckScope, DeleteWhen, PutBackDecision, QueueOptions};
use crate::broker::queue::QueueMessage;
use crate::utils::error::{ErrorSink, PersistenceError};

/// The subset of queue options the handler decides with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPolicy {
    pub acknowledge: AckScope,
    pub acknowledge_timeout: Duration,
    pub delete_when: DeleteWhen,
    pub put_back: PutBackDecision,
    pub max_delivery_attempts: Option<u32>,
}

impl From<&QueueOptions> for DeliveryPolicy {
    fn from(options: &QueueOptions) -> Self {
        Self {
            acknowledge: options.acknowledge,
            acknowledge_timeout: options.acknowledge_timeout(),
            delete_when: options.delete_when,
            put_back: options.put_back,
            max_delivery_attempts: options.max_delivery_attempts,
        }
    }
}

#[derive(Debug)]
pub struct DeliveryRecord {
    pub entry: QueueMessage,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// Subscribers that were sent the message and have not acknowledged yet.
    pub awaiting: HashSet<String>,
}

impl DeliveryRecord {
    pub fn delivery_count(&self) -> u32 {
        self.entry.message.delivery_count
    }
}

/// What to do with a message whose delivery failed.
#[derive(Debug)]
pub enum Decision {
    /// Append it to its pending sequence again.
    PutBack(QueueMessage),
    /// Drop it for good.
    Discard(QueueMessage),
}

#[derive(Debug)]
pub enum AckOutcome {
    /// The delivery is complete.
    Completed(QueueMessage),
    /// Other subscribers still owe an acknowledgment.
    Pending,
    /// Negative acknowledgment, settled per policy.
    Failed(Decision),
    /// No open record for this id, or the client was not targeted.
    Unknown,
}

pub struct DeliveryHandler {
    policy: RwLock<DeliveryPolicy>,
    ledger: RedeliveryLedger,
    records: DashMap<String, DeliveryRecord>,
    uncommitted: DashMap<String, QueueMessage>,
    errors: Arc<dyn ErrorSink>,
}

impl DeliveryHandler {
    pub fn new(options: &QueueOptions, ledger: RedeliveryLedger, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            policy: RwLock::new(DeliveryPolicy::from(options)),
            ledger,
            records: DashMap::new(),
            uncommitted: DashMap::new(),
            errors,
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, options: &QueueOptions) {
        *self.policy.write() = DeliveryPolicy::from(options);
    }

    pub fn ledger(&self) -> &RedeliveryLedger {
        &self.ledger
    }

    /// Reconstructs ledger state. Must run before pending messages are replayed.
    pub fn load(&self) -> Result<usize, PersistenceError> {
        self.ledger.load()
    }

    /// Delivery count recorded for `id`, if any.
    pub fn delivery_count(&self, id: &str) -> Option<u32> {
        self.ledger.get(id)
    }

    /// Registers a send attempt of `entry` to `targets`.
    ///
    /// The incremented count is written to the ledger first; if that write
    /// fails nothing changes and the error is returned.
    pub fn begin_send(
        &self,
        entry: &mut QueueMessage,
        targets: impl IntoIterator<Item = String>,
        now: Instant,
    ) -> Result<u32, PersistenceError> {
        let count = entry.message.delivery_count.saturating_add(1);
        self.ledger.set(&entry.message.id, count)?;
        entry.message.delivery_count = count;

        let timeout = self.policy.read().acknowledge_timeout;
        let record = DeliveryRecord {
            entry: entry.clone(),
            sent_at: now,
            deadline: now + timeout,
            awaiting: targets.into_iter().collect(),
        };
        if self.records.insert(entry.message.id.clone(), record).is_some() {
            debug!(message_id = %entry.message.id, "replaced open delivery record");
        }
        Ok(count)
    }

    /// Applies an acknowledgment from `client_id`.
    pub fn acknowledge(&self, id: &str, client_id: &str, positive: bool) -> AckOutcome {
        let policy = self.policy();

        if !positive {
            let Some((_, record)) = self.records.remove_if(id, |_, r| r.awaiting.contains(client_id))
            else {
                return AckOutcome::Unknown;
            };
            return AckOutcome::Failed(self.decide(record.entry, &policy));
        }

        let finished = match self.records.get_mut(id) {
            Some(mut record) => {
                if !record.awaiting.remove(client_id) {
                    return AckOutcome::Unknown;
                }
                policy.acknowledge != AckScope::EverySubscriber || record.awaiting.is_empty()
            }
            None => return AckOutcome::Unknown,
        };
        if !finished {
            return AckOutcome::Pending;
        }

        let Some((_, record)) = self.records.remove(id) else {
            // settled concurrently by the sweeper
            return AckOutcome::Unknown;
        };
        self.forget_count(id);
        if policy.delete_when == DeleteWhen::OnCommit {
            self.uncommitted
                .insert(id.to_string(), record.entry.clone());
        }
        AckOutcome::Completed(record.entry)
    }

    /// Settles every record whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<Decision> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.deadline <= now)
            .map(|r| r.key().clone())
            .collect();

        let policy = self.policy();
        let mut decisions = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some((_, record)) = self.records.remove_if(&id, |_, r| r.deadline <= now) {
                warn!(
                    message_id = %id,
                    delivery_count = record.delivery_count(),
                    "acknowledge deadline passed"
                );
                decisions.push(self.decide(record.entry, &policy));
            }
        }
        decisions
    }

    /// Settles every open record regardless of deadline.
    pub fn drain(&self) -> Vec<Decision> {
        let ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        let policy = self.policy();
        ids.into_iter()
            .filter_map(|id| self.records.remove(&id))
            .map(|(_, record)| self.decide(record.entry, &policy))
            .collect()
    }

    /// Drops the open record for `id` and its ledger entry.
    pub fn forget(&self, id: &str) -> Option<QueueMessage> {
        let removed = self.records.remove(id).map(|(_, r)| r.entry);
        self.uncommitted.remove(id);
        self.forget_count(id);
        removed
    }

    /// Releases acknowledged messages held for commit.
    pub fn commit(&self) -> Vec<QueueMessage> {
        let ids: Vec<String> = self.uncommitted.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.uncommitted.remove(&id).map(|(_, m)| m))
            .collect()
    }

    pub fn uncommitted(&self) -> usize {
        self.uncommitted.len()
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn close(&self) -> Result<(), PersistenceError> {
        self.ledger.close()
    }

    /// Removes the ledger entry; failures are reported, never propagated.
    pub fn forget_count(&self, id: &str) {
        if let Err(e) = self.ledger.remove(id) {
            self.errors.report("LEDGER_REMOVE", id, &e);
        }
    }

    /// Delete-when-sent wins over put-back: a message the queue already
    /// dropped at send time is never resurrected.
    fn decide(&self, entry: QueueMessage, policy: &DeliveryPolicy) -> Decision {
        let count = entry.message.delivery_count;
        let exhausted = policy
            .max_delivery_attempts
            .is_some_and(|max| count >= max);

        if policy.delete_when == DeleteWhen::AfterSend
            || policy.put_back == PutBackDecision::No
            || exhausted
        {
            self.forget_count(&entry.message.id);
            Decision::Discard(entry)
        } else {
            Decision::PutBack(entry)
        }
    }
}

impl std::fmt::Debug for DeliveryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandler")
            .field("policy", &*self.policy.read())
            .field("in_flight", &self.records.len())
            .field("uncommitted", &self.uncommitted.len())
            .finish()
    }
}
