//! cache v002 -- Persistent send state and tombstones.
//!
//! Adds the `client_status` column via the rebuild-table pattern: build the
//! new table, project-copy the old rows with explicit column coalescing,
//! then atomically swap. Legacy rows predate send tracking, so they are
//! all coalesced to `'sent'`.
//!
//! Also adds `tombstones`: ids of abandoned send attempts. A late ack or
//! echo push for a tombstoned id must never resurrect a row.

use rusqlite::Connection;

const UP_SQL: &str = r#"
BEGIN;

CREATE TABLE messages_new (
    id               INTEGER PRIMARY KEY NOT NULL,
    conversation_key TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    recipient        TEXT NOT NULL,
    payload          TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    status           INTEGER NOT NULL DEFAULT 0,
    client_status    TEXT NOT NULL DEFAULT 'sent'   -- 'sending' | 'sent' | 'fail'
);

INSERT INTO messages_new
    (id, conversation_key, sender_id, recipient, payload, created_at, status, client_status)
SELECT
    id,
    conversation_key,
    sender_id,
    recipient,
    payload,
    created_at,
    COALESCE(status, 0),
    'sent'
FROM messages;

DROP TABLE messages;
ALTER TABLE messages_new RENAME TO messages;

CREATE INDEX IF NOT EXISTS idx_cache_conversation
    ON messages(conversation_key, created_at, id);

CREATE TABLE IF NOT EXISTS tombstones (
    id         INTEGER PRIMARY KEY NOT NULL,  -- abandoned snowflake id
    created_at TEXT NOT NULL
);

COMMIT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
