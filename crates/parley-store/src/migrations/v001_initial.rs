//! v001 -- Initial schema creation.
//!
//! Creates the two core tables: `users` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (owned by the account system; the relay only reads them)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY NOT NULL,
    username      TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    avatar        TEXT,
    about         TEXT,
    password_hash TEXT NOT NULL,
    created_at    TEXT NOT NULL               -- RFC-3339
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id       TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    sender   TEXT NOT NULL,
    receiver TEXT NOT NULL,
    content  TEXT NOT NULL,
    date     TEXT NOT NULL,                   -- RFC-3339, server-assigned
    seen     INTEGER NOT NULL DEFAULT 0       -- boolean 0/1
);

CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(sender, receiver, seen);

CREATE INDEX IF NOT EXISTS idx_messages_receiver
    ON messages(receiver);

CREATE INDEX IF NOT EXISTS idx_messages_date
    ON messages(date);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
