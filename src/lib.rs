//! # relaymq
//!
//! `relaymq` is a queue-based message broker with configurable reliability:
//! fire-and-forget broadcast, acknowledged delivery with redelivery that
//! survives a restart, and request/response between connected clients. It
//! uses WebSockets for client communication and `sled` for durable state.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: Queues, delivery tracking, the redelivery ledger, bindings and the engine tying them together.
//! - `client`: Represents a connected WebSocket peer.
//! - `config`: Handles loading and managing server and client configuration.
//! - `connector`: The client side: correlation of replies, retrying executors and the connection itself.
//! - `persistence`: Durable delivery counts, queue definitions and pending messages.
//! - `transport`: Manages the WebSocket server and frame dispatch.
//! - `utils`: Contains shared utilities, such as error handling and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod connector;
pub mod persistence;
pub mod transport;
pub mod utils;
