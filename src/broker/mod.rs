pub mod binding;
pub mod codec;
pub mod delivery;
pub mod engine;
pub mod hooks;
pub mod ledger;
pub mod message;
pub mod options;
pub mod queue;

pub use binding::{AutoQueueBinding, BindingInteraction};
pub use delivery::{AckOutcome, Decision, DeliveryHandler, DeliveryPolicy};
pub use engine::Broker;
pub use hooks::SubscriptionHook;
pub use ledger::RedeliveryLedger;
pub use message::{Message, MessageKind, ResultCode};
pub use options::{AckScope, DeleteWhen, ProducerAck, PutBackDecision, QueueOptions, QueueStatus};
pub use queue::{PushResult, Queue, QueueInfo, QueueMessage, SubscriptionResult};
