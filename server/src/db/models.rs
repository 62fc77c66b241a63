//! Database row types for the chat tables.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs
//! and double as the canonical wire schema for outbound frames and REST history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identity issued by the identity provider.
pub type UserId = u64;

/// Message kind, serialized as the integer `type` field (1 = text, 2 = image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    Text = 1,
    Image = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Text),
            2 => Ok(Self::Image),
            other => Err(format!("unknown message type {}", other)),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

/// A persisted chat message in the messages table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub is_read: bool,
}

/// A message that has not been persisted yet: no id, no timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub kind: MessageKind,
}

/// One entry in a user's recent contact list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub id: UserId,
    pub username: String,
    pub nickname: String,
    pub avatar: String,
    pub last_msg: String,
    pub time: DateTime<Utc>,
}
