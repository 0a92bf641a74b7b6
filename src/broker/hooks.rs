//! Subscription hooks
//!
//! Hooks run in registration order. `can_subscribe` stops at the first veto;
//! the notifications are delivered to every hook.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::queue::Queue;
use crate::transport::Connection;

pub trait SubscriptionHook: Send + Sync {
    fn can_subscribe(&self, _queue: &Queue, _client: &dyn Connection) -> bool {
        true
    }

    fn on_subscribe(&self, _queue: &Queue, _client: &dyn Connection) {}

    fn on_unsubscribe(&self, _queue: &Queue, _client_id: &str) {}
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn SubscriptionHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn SubscriptionHook>) {
        self.hooks.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    // Hooks are cloned out so a hook may register another hook.
    fn snapshot(&self) -> Vec<Arc<dyn SubscriptionHook>> {
        self.hooks.read().clone()
    }

    pub fn can_subscribe(&self, queue: &Queue, client: &dyn Connection) -> bool {
        self.snapshot()
            .iter()
            .all(|hook| hook.can_subscribe(queue, client))
    }

    pub fn on_subscribe(&self, queue: &Queue, client: &dyn Connection) {
        for hook in self.snapshot() {
            hook.on_subscribe(queue, client);
        }
    }

    pub fn on_unsubscribe(&self, queue: &Queue, client_id: &str) {
        for hook in self.snapshot() {
            hook.on_unsubscribe(queue, client_id);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.len())
            .finish()
    }
}
