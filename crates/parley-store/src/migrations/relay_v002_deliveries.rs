//! relay v002 -- Per-member delivery tracking for group messages.
//!
//! One row per (message, member); each member's status advances
//! independently of the others.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS deliveries (
    message_id INTEGER NOT NULL,              -- FK -> messages(id)
    member_id  TEXT NOT NULL,                 -- FK -> users(id)
    status     INTEGER NOT NULL DEFAULT 0,    -- 0 queued, 1 delivered, 2 read

    PRIMARY KEY (message_id, member_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_deliveries_member_status
    ON deliveries(member_id, status);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
