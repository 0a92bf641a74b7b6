//! Redelivery ledger
//!
//! Durable map of message id -> delivery count. Every send attempt of an
//! acknowledge-tracked message writes its new count here before the frame
//! leaves the broker, so after a crash the queue knows how many times each
//! pending message was already handed out.
//!
//! The in-memory map mirrors the store. Writes for one id hold that id's map
//! entry while the store is written, so concurrent writers of the same id
//! serialize and the map never disagrees with the last successful store write.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::persistence::{DeliveryStore, MemoryDeliveryStore};
use crate::utils::error::PersistenceError;

pub struct RedeliveryLedger {
    store: Box<dyn DeliveryStore>,
    entries: DashMap<String, u32>,
}

impl RedeliveryLedger {
    pub fn new(store: impl DeliveryStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            entries: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryDeliveryStore::new())
    }

    /// Rebuilds the in-memory view from the store, reopening it if it was
    /// closed. Returns the number of entries loaded.
    pub fn load(&self) -> Result<usize, PersistenceError> {
        let loaded = self.store.load()?;
        self.entries.clear();
        for (id, count) in loaded {
            self.entries.insert(id, count);
        }
        Ok(self.entries.len())
    }

    pub fn set(&self, id: &str, count: u32) -> Result<(), PersistenceError> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut slot) => {
                self.store.set(id, count)?;
                *slot.get_mut() = count;
            }
            Entry::Vacant(slot) => {
                self.store.set(id, count)?;
                slot.insert(count);
            }
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(slot) => {
                self.store.remove(id)?;
                slot.remove();
            }
            Entry::Vacant(_) => self.store.remove(id)?,
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<u32> {
        self.entries.get(id).map(|count| *count)
    }

    /// Every entry, ordered by id.
    pub fn get_deliveries(&self) -> Vec<(String, u32)> {
        let mut deliveries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        deliveries.sort();
        deliveries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) -> Result<(), PersistenceError> {
        self.store.clear()?;
        self.entries.clear();
        Ok(())
    }

    /// Flushes and releases the store. `load` brings it back.
    pub fn close(&self) -> Result<(), PersistenceError> {
        self.store.close()?;
        self.entries.clear();
        Ok(())
    }
}

impl std::fmt::Debug for RedeliveryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryLedger")
            .field("entries", &self.entries.len())
            .finish()
    }
}
