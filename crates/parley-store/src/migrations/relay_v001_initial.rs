//! relay v001 -- Initial relay log schema.
//!
//! Creates `users`, `friendships`, `groups`, `group_members` and the
//! append-only `messages` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- opaque immutable identity key
    display_name TEXT NOT NULL,               -- mutable
    created_at   TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Friendships (directional request, accepted flag)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    requester  TEXT NOT NULL,                 -- FK -> users(id)
    addressee  TEXT NOT NULL,                 -- FK -> users(id)
    accepted   INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    created_at TEXT NOT NULL,

    PRIMARY KEY (requester, addressee),
    FOREIGN KEY (requester) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (addressee) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Groups and membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL,                  -- FK -> groups(id)
    member_id TEXT NOT NULL,                  -- FK -> users(id)

    PRIMARY KEY (group_id, member_id),
    FOREIGN KEY (group_id)  REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (member_id) REFERENCES users(id)  ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages (append-only; status is the only mutable column)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY NOT NULL,  -- snowflake id
    conversation_key TEXT NOT NULL,                 -- canonical pair or group key
    sender_id        TEXT NOT NULL,
    recipient        TEXT NOT NULL,                 -- 'u:<id>' or 'g:<uuid>'
    payload          TEXT NOT NULL,                 -- JSON envelope
    created_at       TEXT NOT NULL,                 -- ISO-8601, ms precision
    status           INTEGER NOT NULL DEFAULT 0     -- 0 queued, 1 delivered, 2 read
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_key, created_at, id);

CREATE INDEX IF NOT EXISTS idx_messages_recipient_status
    ON messages(recipient, status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
