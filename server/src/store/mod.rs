//! Message persistence.
//!
//! The relay only needs `create`; `history` and `contacts` back the REST
//! endpoints and read the same canonical schema. Implementations are
//! synchronous (rusqlite), so async callers go through [`persist`] and
//! friends, which hop onto the blocking pool.

pub mod sqlite;

use std::sync::Arc;

use crate::db::models::{Contact, Message, NewMessage, UserId};

pub use sqlite::SqliteMessageStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Durable, append-only record of chat messages.
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message, assigning its id and timestamps atomically with the write.
    fn create(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// All messages exchanged between `user` and `peer`, oldest first.
    fn history(&self, user: UserId, peer: UserId) -> Result<Vec<Message>, StoreError>;

    /// Distinct counterparties of `user`, most recent conversation first.
    fn contacts(&self, user: UserId) -> Result<Vec<Contact>, StoreError>;
}

pub type SharedStore = Arc<dyn MessageStore>;

/// Run `create` on the blocking pool.
pub async fn persist(store: SharedStore, message: NewMessage) -> Result<Message, StoreError> {
    tokio::task::spawn_blocking(move || store.create(message))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Run `history` on the blocking pool.
pub async fn load_history(
    store: SharedStore,
    user: UserId,
    peer: UserId,
) -> Result<Vec<Message>, StoreError> {
    tokio::task::spawn_blocking(move || store.history(user, peer))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Run `contacts` on the blocking pool.
pub async fn load_contacts(store: SharedStore, user: UserId) -> Result<Vec<Contact>, StoreError> {
    tokio::task::spawn_blocking(move || store.contacts(user))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
