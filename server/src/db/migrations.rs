use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: chat messages

CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    kind INTEGER NOT NULL DEFAULT 1,
    is_read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_messages_sender ON messages(sender_id, receiver_id);
CREATE INDEX idx_messages_receiver ON messages(receiver_id, sender_id);
CREATE INDEX idx_messages_created ON messages(created_at);
",
        ),
        M::up(
            "-- Migration 2: user profiles (owned by the account service, read here for contacts)

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    nickname TEXT NOT NULL DEFAULT '',
    avatar TEXT NOT NULL DEFAULT ''
);
",
        ),
    ])
}
