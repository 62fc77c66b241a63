//! JSON framing for the relay.
//!
//! Inbound: `{"receiver_id": u64, "content": str, "type": 1|2}`.
//! Outbound: the full persisted [`Message`] record.

use serde::Deserialize;

use crate::db::models::{Message, MessageKind, NewMessage, UserId};

/// Message as sent by a client. The sender is never taken from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl InboundFrame {
    /// Provisional record with `sender_id` as the author.
    pub fn into_new_message(self, sender_id: UserId) -> NewMessage {
        NewMessage {
            sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            kind: self.kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Decode one inbound frame. Unknown `type` values are malformed.
pub fn decode_frame(data: &[u8]) -> Result<InboundFrame, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Reject frames over `limit` bytes before decoding.
pub fn check_size(data: &[u8], limit: usize) -> Result<(), ProtocolError> {
    if data.len() > limit {
        return Err(ProtocolError::TooLarge {
            size: data.len(),
            limit,
        });
    }
    Ok(())
}

/// Serialize a persisted message for the wire.
pub fn encode_message(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
