//! cache v001 -- Initial local cache schema.
//!
//! The first shipped cache only mirrored the server's message shape; the
//! client's own send state lived in memory and was lost on restart.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY NOT NULL,  -- snowflake id
    conversation_key TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    recipient        TEXT NOT NULL,
    payload          TEXT NOT NULL,                 -- JSON envelope
    created_at       TEXT NOT NULL,                 -- ISO-8601, ms precision
    status           INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cache_conversation
    ON messages(conversation_key, created_at, id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
