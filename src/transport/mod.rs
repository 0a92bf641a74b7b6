//! The `transport` module is responsible for handling network communication
//! with clients, primarily via WebSockets.
//!
//! `Connection` is the boundary the broker is written against. `dispatch`
//! maps decoded frames onto broker operations and `websocket` implements the
//! server itself: accepting connections, running the per-client writer and
//! forwarding frames to the dispatcher.

pub mod connection;
pub mod dispatch;
pub mod websocket;

pub use connection::Connection;
