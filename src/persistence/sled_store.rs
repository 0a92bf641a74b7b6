//! Persistence layer backed by `sled`
//!
//! Layout, one tree per concern:
//! - `queues`: lowercase queue name -> JSON `QueueDefinition`
//! - `messages/<queue>`: insertion sequence (big-endian u64) -> JSON `Message`
//! - `message-index/<queue>`: message id -> insertion sequence
//! - `deliveries/<queue>`: message id -> delivery count (big-endian u32)
//!
//! Sequence keys come from `Db::generate_id`, so iterating a message tree
//! yields messages in the order they were pushed.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::message::Message;
use crate::broker::options::{QueueOptions, QueueStatus};
use crate::persistence::DeliveryStore;
use crate::utils::error::PersistenceError;

const QUEUES_TREE: &str = "queues";
const DELIVERIES_TREE: &str = "deliveries";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub name: String,
    pub status: QueueStatus,
    pub options: QueueOptions,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn save_queue(&self, definition: &QueueDefinition) -> Result<(), PersistenceError> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        let data = serde_json::to_vec(definition)?;
        tree.insert(definition.name.to_lowercase().as_bytes(), data)?;
        Ok(())
    }

    pub fn load_queues(&self) -> Result<Vec<QueueDefinition>, PersistenceError> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        let mut definitions = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            definitions.push(serde_json::from_slice(&value)?);
        }
        Ok(definitions)
    }

    /// Removes the definition and every tree belonging to `queue`.
    pub fn remove_queue(&self, queue: &str) -> Result<(), PersistenceError> {
        let key = queue.to_lowercase();
        self.db.open_tree(QUEUES_TREE)?.remove(key.as_bytes())?;
        for name in [
            messages_tree(&key),
            index_tree(&key),
            deliveries_tree(&key),
        ] {
            self.db.drop_tree(name.as_bytes())?;
        }
        Ok(())
    }

    /// Store a message for `queue`, keyed by insertion sequence.
    pub fn store_message(&self, queue: &str, message: &Message) -> Result<(), PersistenceError> {
        let key = queue.to_lowercase();
        let seq = self.db.generate_id()?.to_be_bytes();
        let data = serde_json::to_vec(message)?;

        let messages = self.db.open_tree(messages_tree(&key))?;
        let index = self.db.open_tree(index_tree(&key))?;

        if let Some(previous) = index.insert(message.id.as_bytes(), &seq)? {
            messages.remove(previous)?;
        }
        messages.insert(seq, data)?;
        Ok(())
    }

    /// Returns true when a stored message was removed.
    pub fn remove_message(&self, queue: &str, id: &str) -> Result<bool, PersistenceError> {
        let key = queue.to_lowercase();
        let index = self.db.open_tree(index_tree(&key))?;
        match index.remove(id.as_bytes())? {
            Some(seq) => {
                self.db.open_tree(messages_tree(&key))?.remove(seq)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load stored messages for a queue in push order.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<Message>, PersistenceError> {
        let tree = self.db.open_tree(messages_tree(&queue.to_lowercase()))?;
        let mut messages = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            messages.push(serde_json::from_slice(&value)?);
        }
        Ok(messages)
    }

    /// Delivery-count store for `queue`, sharing this database.
    pub fn delivery_store(&self, queue: &str) -> Result<SledDeliveryStore, PersistenceError> {
        SledDeliveryStore::in_tree(&self.db, &deliveries_tree(&queue.to_lowercase()))
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}

fn messages_tree(queue: &str) -> String {
    format!("messages/{queue}")
}

fn index_tree(queue: &str) -> String {
    format!("message-index/{queue}")
}

fn deliveries_tree(queue: &str) -> String {
    format!("{DELIVERIES_TREE}/{queue}")
}

enum StoreSource {
    /// Owns its own database file.
    Path(PathBuf),
    /// A tree inside a database shared with other stores.
    Shared { db: Db, tree: String },
}

struct StoreHandle {
    // Held so the file stays open until `close`.
    _db: Option<Db>,
    tree: Tree,
}

/// `DeliveryStore` over a sled tree.
pub struct SledDeliveryStore {
    source: StoreSource,
    handle: RwLock<Option<StoreHandle>>,
}

impl SledDeliveryStore {
    /// Opens a dedicated database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let store = Self {
            source: StoreSource::Path(path.as_ref().to_path_buf()),
            handle: RwLock::new(None),
        };
        store.reopen()?;
        Ok(store)
    }

    /// Uses tree `name` of an already open database.
    pub fn in_tree(db: &Db, name: &str) -> Result<Self, PersistenceError> {
        let store = Self {
            source: StoreSource::Shared {
                db: db.clone(),
                tree: name.to_string(),
            },
            handle: RwLock::new(None),
        };
        store.reopen()?;
        Ok(store)
    }

    fn reopen(&self) -> Result<(), PersistenceError> {
        let handle = match &self.source {
            StoreSource::Path(path) => {
                let db = sled::open(path)?;
                let tree = db.open_tree(DELIVERIES_TREE)?;
                StoreHandle { _db: Some(db), tree }
            }
            StoreSource::Shared { db, tree } => StoreHandle {
                _db: None,
                tree: db.open_tree(tree)?,
            },
        };
        *self.handle.write() = Some(handle);
        Ok(())
    }

    fn tree(&self) -> Result<Tree, PersistenceError> {
        self.handle
            .read()
            .as_ref()
            .map(|h| h.tree.clone())
            .ok_or(PersistenceError::Closed)
    }
}

fn decode_count(value: &[u8]) -> Result<u32, PersistenceError> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| PersistenceError::Corrupt(format!("delivery count of {} bytes", value.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

impl DeliveryStore for SledDeliveryStore {
    fn load(&self) -> Result<Vec<(String, u32)>, PersistenceError> {
        if self.handle.read().is_none() {
            self.reopen()?;
        }
        self.list()
    }

    fn set(&self, id: &str, count: u32) -> Result<(), PersistenceError> {
        self.tree()?.insert(id.as_bytes(), &count.to_be_bytes())?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), PersistenceError> {
        self.tree()?.remove(id.as_bytes())?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, u32)>, PersistenceError> {
        let mut entries = Vec::new();
        for entry in self.tree()?.iter() {
            let (key, value) = entry?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
            entries.push((id, decode_count(&value)?));
        }
        Ok(entries)
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.tree()?.clear()?;
        Ok(())
    }

    fn close(&self) -> Result<(), PersistenceError> {
        if let Some(handle) = self.handle.write().take() {
            handle.tree.flush()?;
        }
        Ok(())
    }
}
