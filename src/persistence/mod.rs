//! The `persistence` module provides the durable state the broker needs to
//! survive a restart: delivery counts of in-flight messages, persistent queue
//! definitions and the pending messages of those queues.
//!
//! It uses `sled` as an embedded key-value store. `DeliveryStore` is the
//! narrow boundary the redelivery ledger is written against; `MemoryDeliveryStore`
//! implements it for non-persistent queues and tests.

pub mod sled_store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::utils::error::PersistenceError;

pub use sled_store::{Persistence, QueueDefinition, SledDeliveryStore};

/// Durable map of message id to delivery count.
pub trait DeliveryStore: Send + Sync {
    /// Opens the store if needed and returns every entry, ordered by id.
    fn load(&self) -> Result<Vec<(String, u32)>, PersistenceError>;

    fn set(&self, id: &str, count: u32) -> Result<(), PersistenceError>;

    fn remove(&self, id: &str) -> Result<(), PersistenceError>;

    fn list(&self) -> Result<Vec<(String, u32)>, PersistenceError>;

    fn clear(&self) -> Result<(), PersistenceError>;

    /// Flushes and releases the underlying handle. `load` reopens it.
    fn close(&self) -> Result<(), PersistenceError>;
}

/// In-process store. Clones share the same entries, which lets a test
/// "restart" by building a new ledger over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeliveryStore {
    entries: Arc<Mutex<BTreeMap<String, u32>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }
}

impl DeliveryStore for MemoryDeliveryStore {
    fn load(&self) -> Result<Vec<(String, u32)>, PersistenceError> {
        self.closed.store(false, Ordering::SeqCst);
        self.list()
    }

    fn set(&self, id: &str, count: u32) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.entries.lock().insert(id.to_string(), count);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.entries.lock().remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, u32)>, PersistenceError> {
        self.ensure_open()?;
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.entries.lock().clear();
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
