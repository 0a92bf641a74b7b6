//! Frame encoding.
//!
//! Frames are JSON documents. Encoding is a pure function so every client and
//! every queue can call it concurrently without a shared writer.

use bytes::Bytes;

use crate::broker::message::Message;
use crate::utils::error::CodecError;

pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(data).map_err(CodecError::Decode)
}
