//! The `connector` module is the client side of the broker protocol.
//!
//! - `follower`: matches acknowledgment and response frames to waiting calls
//! - `executor`: runs consumers and request handlers with bounded retry
//! - `mq_client`: the connection itself, built on the two above

pub mod executor;
pub mod follower;
pub mod mq_client;

pub use executor::{
    ConsumerExecutor, ExecutionError, FailureKind, HandlerError, QueueConsumer, RequestExecutor,
    RequestHandler, RetryOptions, run_with_retry,
};
pub use follower::{FollowKind, MessageFollower, PendingReply};
pub use mq_client::{ClientOptions, MqClient};

#[cfg(test)]
mod tests;
