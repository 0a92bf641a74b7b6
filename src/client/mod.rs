//! The `client` module defines the broker's handle on a connected peer.
//!
//! `Client` encapsulates the peer's id, the channel used to push frames to
//! it, its connected flag and the queues it subscribed to.

pub mod pubsub_client;
pub use pubsub_client::Client;
