use super::{DeliveryStore, MemoryDeliveryStore, Persistence, QueueDefinition, SledDeliveryStore};
use crate::broker::message::Message;
use crate::broker::options::{AckScope, QueueOptions, QueueStatus};
use crate::utils::error::PersistenceError;

use tempfile::tempdir;

fn create_test_persistence() -> (tempfile::TempDir, Persistence) {
    let dir = tempdir().unwrap();
    let persistence = Persistence::new(dir.path().join("db")).unwrap();
    (dir, persistence)
}

#[test]
fn test_memory_store_last_write_wins() {
    let store = MemoryDeliveryStore::new();
    store.set("msg1", 1).unwrap();
    store.set("msg1", 2).unwrap();

    assert_eq!(store.list().unwrap(), vec![("msg1".to_string(), 2)]);
}

#[test]
fn test_memory_store_closed_rejects_writes() {
    let store = MemoryDeliveryStore::new();
    store.close().unwrap();

    assert!(matches!(store.set("a", 1), Err(PersistenceError::Closed)));

    store.load().unwrap();
    store.set("a", 1).unwrap();
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn test_sled_store_set_overwrite_and_remove() {
    let dir = tempdir().unwrap();
    let store = SledDeliveryStore::open(dir.path().join("deliveries")).unwrap();

    store.set("msg1", 1).unwrap();
    store.set("msg1", 2).unwrap();
    store.set("msg2", 5).unwrap();
    assert_eq!(
        store.list().unwrap(),
        vec![("msg1".to_string(), 2), ("msg2".to_string(), 5)]
    );

    store.remove("msg1").unwrap();
    assert_eq!(store.list().unwrap(), vec![("msg2".to_string(), 5)]);

    store.clear().unwrap();
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn test_sled_store_survives_close_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("deliveries");

    let store = SledDeliveryStore::open(&path).unwrap();
    store.set("id", 4).unwrap();
    store.close().unwrap();
    assert!(matches!(store.set("id", 5), Err(PersistenceError::Closed)));
    drop(store);

    let reopened = SledDeliveryStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap(), vec![("id".to_string(), 4)]);
}

#[test]
fn test_sled_store_load_reopens_after_close() {
    let dir = tempdir().unwrap();
    let store = SledDeliveryStore::open(dir.path().join("deliveries")).unwrap();
    store.set("msg1", 3).unwrap();
    store.close().unwrap();

    assert_eq!(store.load().unwrap(), vec![("msg1".to_string(), 3)]);
    store.set("msg1", 4).unwrap();
    assert_eq!(store.list().unwrap(), vec![("msg1".to_string(), 4)]);
}

#[test]
fn test_store_and_load_messages_in_push_order() {
    let (_dir, persistence) = create_test_persistence();

    for i in 0..5 {
        let mut msg = Message::queue_message("orders", format!("msg{i}"));
        msg.id = format!("id{i}");
        persistence.store_message("orders", &msg).unwrap();
    }

    let payloads: Vec<_> = persistence
        .load_messages("ORDERS")
        .unwrap()
        .into_iter()
        .map(|m| m.content_str().unwrap().to_string())
        .collect();
    assert_eq!(payloads, vec!["msg0", "msg1", "msg2", "msg3", "msg4"]);
}

#[test]
fn test_remove_message() {
    let (_dir, persistence) = create_test_persistence();
    let mut msg = Message::queue_message("orders", "hello");
    msg.id = "m1".into();
    persistence.store_message("orders", &msg).unwrap();

    assert!(persistence.remove_message("orders", "m1").unwrap());
    assert!(!persistence.remove_message("orders", "m1").unwrap());
    assert!(persistence.load_messages("orders").unwrap().is_empty());
}

#[test]
fn test_restoring_same_id_keeps_one_copy() {
    let (_dir, persistence) = create_test_persistence();
    let mut msg = Message::queue_message("orders", "hello");
    msg.id = "m1".into();
    persistence.store_message("orders", &msg).unwrap();
    persistence.store_message("orders", &msg).unwrap();

    assert_eq!(persistence.load_messages("orders").unwrap().len(), 1);
}

#[test]
fn test_empty_queue_returns_empty_vec() {
    let (_dir, persistence) = create_test_persistence();
    assert!(persistence.load_messages("nonexistent").unwrap().is_empty());
}

#[test]
fn test_queue_definitions_roundtrip_and_remove() {
    let (_dir, persistence) = create_test_persistence();
    let definition = QueueDefinition {
        name: "Orders".into(),
        status: QueueStatus::Paused,
        options: QueueOptions {
            acknowledge: AckScope::FirstAcquirer,
            ..QueueOptions::default()
        },
    };
    persistence.save_queue(&definition).unwrap();

    let mut msg = Message::queue_message("orders", "hello");
    msg.id = "m1".into();
    persistence.store_message("orders", &msg).unwrap();
    let deliveries = persistence.delivery_store("Orders").unwrap();
    deliveries.set("m1", 2).unwrap();

    assert_eq!(persistence.load_queues().unwrap(), vec![definition]);

    drop(deliveries);
    persistence.remove_queue("ORDERS").unwrap();
    assert!(persistence.load_queues().unwrap().is_empty());
    assert!(persistence.load_messages("orders").unwrap().is_empty());
    assert!(
        persistence
            .delivery_store("orders")
            .unwrap()
            .list()
            .unwrap()
            .is_empty()
    );
}
