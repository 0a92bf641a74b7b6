//! The connection capability the delivery engine is written against.
//!
//! A connection never opens sockets itself. `send` hands an encoded frame to
//! the connection's writer and returns immediately; the actual socket write
//! happens elsewhere (for WebSocket clients, in the per-client send loop).
//! Implementations must not block in `send`.

use bytes::Bytes;

use crate::utils::error::TransportError;

pub trait Connection: Send + Sync {
    /// Unique id of the remote client.
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Queues `frame` for writing.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;
}
