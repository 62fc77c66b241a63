use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::{MessageStore, StoreError};
use crate::db::models::{Contact, Message, MessageKind, NewMessage, UserId};
use crate::db::DbPool;

/// [`MessageStore`] over the shared SQLite connection.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: DbPool,
}

impl SqliteMessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn kind_from_row(raw: i64) -> Result<MessageKind, StoreError> {
    u8::try_from(raw)
        .map_err(|_| StoreError::CorruptRow(format!("message kind {} out of range", raw)))
        .and_then(|v| MessageKind::try_from(v).map_err(StoreError::CorruptRow))
}

/// Raw column values; the kind is validated after the row closure returns.
struct MessageRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sender_id: i64,
    receiver_id: i64,
    content: String,
    kind: i64,
    is_read: bool,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            sender_id: row.get(3)?,
            receiver_id: row.get(4)?,
            content: row.get(5)?,
            kind: row.get(6)?,
            is_read: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        Ok(Message {
            id: self.id as u64,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sender_id: self.sender_id as u64,
            receiver_id: self.receiver_id as u64,
            content: self.content,
            kind: kind_from_row(self.kind)?,
            is_read: self.is_read,
        })
    }
}

impl MessageStore for SqliteMessageStore {
    fn create(&self, message: NewMessage) -> Result<Message, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages (created_at, updated_at, sender_id, receiver_id, content, kind, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            rusqlite::params![
                now,
                now,
                message.sender_id as i64,
                message.receiver_id as i64,
                message.content,
                u8::from(message.kind) as i64,
            ],
        )?;
        // Still holding the lock, so the rowid is ours
        let id = conn.last_insert_rowid();

        Ok(Message {
            id: id as u64,
            created_at: now,
            updated_at: now,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            kind: message.kind,
            is_read: false,
        })
    }

    fn history(&self, user: UserId, peer: UserId) -> Result<Vec<Message>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT id, created_at, updated_at, sender_id, receiver_id, content, kind, is_read
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(
                rusqlite::params![user as i64, peer as i64],
                MessageRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    fn contacts(&self, user: UserId) -> Result<Vec<Contact>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT latest.peer,
                    COALESCE(u.username, ''), COALESCE(u.nickname, ''), COALESCE(u.avatar, ''),
                    m.content, m.created_at
             FROM (
                 SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS peer,
                        MAX(id) AS last_id
                 FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 GROUP BY peer
             ) latest
             JOIN messages m ON m.id = latest.last_id
             LEFT JOIN users u ON u.id = latest.peer
             ORDER BY m.id DESC",
        )?;

        let contacts = stmt
            .query_map(rusqlite::params![user as i64], |row| {
                Ok(Contact {
                    id: row.get::<_, i64>(0)? as u64,
                    username: row.get(1)?,
                    nickname: row.get(2)?,
                    avatar: row.get(3)?,
                    last_msg: row.get(4)?,
                    time: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn store() -> SqliteMessageStore {
        SqliteMessageStore::new(open_in_memory().unwrap())
    }

    fn text(sender_id: UserId, receiver_id: UserId, content: &str) -> NewMessage {
        NewMessage {
            sender_id,
            receiver_id,
            content: content.to_string(),
            kind: MessageKind::Text,
        }
    }

    #[test]
    fn test_create_assigns_id_and_timestamps() {
        let store = store();
        let first = store.create(text(1, 2, "hi")).unwrap();
        let second = store.create(text(2, 1, "hello")).unwrap();

        assert!(first.id > 0);
        assert!(second.id > first.id);
        assert_eq!(first.created_at, first.updated_at);
        assert_eq!(first.sender_id, 1);
        assert_eq!(first.receiver_id, 2);
        assert_eq!(first.content, "hi");
        assert!(!first.is_read);
    }

    #[test]
    fn test_history_covers_both_directions_only() {
        let store = store();
        store.create(text(1, 2, "a")).unwrap();
        store.create(text(2, 1, "b")).unwrap();
        store.create(text(1, 3, "not ours")).unwrap();
        store
            .create(NewMessage {
                kind: MessageKind::Image,
                ..text(1, 2, "https://img/1.png")
            })
            .unwrap();

        let history = store.history(2, 1).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "https://img/1.png"]);
        assert_eq!(history[2].kind, MessageKind::Image);
    }

    #[test]
    fn test_contacts_latest_first_with_profile_fallback() {
        let store = store();
        {
            let conn = store.db.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, username, nickname, avatar) VALUES (2, 'bob', 'Bobby', '/a/bob.png')",
                [],
            )
            .unwrap();
        }

        store.create(text(1, 2, "to bob")).unwrap();
        store.create(text(3, 1, "from carol")).unwrap();
        store.create(text(2, 1, "bob again")).unwrap();

        let contacts = store.contacts(1).unwrap();
        assert_eq!(contacts.len(), 2);

        assert_eq!(contacts[0].id, 2);
        assert_eq!(contacts[0].username, "bob");
        assert_eq!(contacts[0].nickname, "Bobby");
        assert_eq!(contacts[0].last_msg, "bob again");

        // No profile row for user 3
        assert_eq!(contacts[1].id, 3);
        assert_eq!(contacts[1].username, "");
        assert_eq!(contacts[1].last_msg, "from carol");
    }
}
