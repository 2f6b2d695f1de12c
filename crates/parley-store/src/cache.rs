//! The client's local message cache.
//!
//! Same message shape as the relay log plus the `client_status` column
//! (the client's view of its own send attempt) and a tombstone table for
//! abandoned send attempts. Inserts are deduplicated by id: a message
//! already present is never re-inserted.

use chrono::Utc;
use parley_shared::protocol::PageCursor;
use parley_shared::{ClientStatus, ConversationKey, Message, MessageId, UserId};
use rusqlite::params;

use crate::database::{ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::messages::row_to_message;

impl Database {
    /// Insert a message unless its id is already present or tombstoned.
    /// Returns whether a row was actually inserted.
    pub fn cache_insert(&self, message: &Message, client_status: ClientStatus) -> Result<bool> {
        if self.is_tombstoned(message.id)? {
            return Ok(false);
        }

        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, conversation_key, sender_id, recipient, payload, created_at, status, client_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.0 as i64,
                message.conversation.to_column(),
                message.sender.as_str(),
                message.recipient.to_column(),
                serde_json::to_string(&message.payload)?,
                ts_to_sql(&message.created_at),
                message.status.as_i64(),
                client_status.as_str(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn cache_contains(&self, id: MessageId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id.0 as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn cache_get(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, conversation_key, sender_id, recipient, payload, created_at, status
                   FROM messages WHERE id = ?1",
                params![id.0 as i64],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn set_client_status(&self, id: MessageId, status: ClientStatus) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE messages SET client_status = ?1 WHERE id = ?2",
            params![status.as_str(), id.0 as i64],
        )?;
        Ok(updated > 0)
    }

    pub fn client_status(&self, id: MessageId) -> Result<Option<ClientStatus>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT client_status FROM messages WHERE id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match raw {
            None => Ok(None),
            Some(s) => ClientStatus::parse(&s)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt(format!("invalid client status: {s}"))),
        }
    }

    pub fn cache_remove(&self, id: MessageId) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.0 as i64],
        )?;
        Ok(removed > 0)
    }

    /// Abandon an id: a late ack or an echo push for it is dropped forever.
    pub fn add_tombstone(&self, id: MessageId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO tombstones (id, created_at) VALUES (?1, ?2)",
            params![id.0 as i64, ts_to_sql(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn is_tombstoned(&self, id: MessageId) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM tombstones WHERE id = ?1)",
            params![id.0 as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Same boundary-cursor paging as the relay log, over the local view.
    pub fn cache_page(
        &self,
        conversation: &ConversationKey,
        before: Option<PageCursor>,
        limit: u32,
    ) -> Result<(Vec<Message>, Option<PageCursor>)> {
        self.page_messages(conversation, before, limit)
    }

    /// Ids still marked `sending`, oldest first. Used on startup to fail
    /// out attempts that never resolved before the previous shutdown.
    pub fn cache_unresolved_sends(&self, owner: &UserId) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM messages
              WHERE sender_id = ?1 AND client_status = 'sending'
              ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![owner.as_str()], |row| {
            row.get::<_, i64>(0).map(|v| MessageId(v as u64))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
