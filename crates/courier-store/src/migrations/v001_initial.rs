//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `users` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,          -- case-sensitive
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,                 -- salt_hex$digest_hex
    created_at    TEXT NOT NULL                  -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages (undelivered rows form the per-recipient pending queue)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id   INTEGER NOT NULL,               -- FK -> users(id)
    receiver_id INTEGER NOT NULL,               -- FK -> users(id)
    content     TEXT NOT NULL,
    sent_at     TEXT NOT NULL,                  -- RFC-3339
    delivered   INTEGER NOT NULL DEFAULT 0,     -- boolean 0/1

    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (receiver_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_pending
    ON messages(receiver_id, delivered, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
