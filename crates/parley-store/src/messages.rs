//! The relay's append-only message log.
//!
//! `status` is the only mutable column and only ever moves forward
//! (queued -> delivered -> read). Group messages keep one log row plus one
//! `deliveries` row per addressed member; each member advances alone.

use parley_shared::protocol::PageCursor;
use parley_shared::{
    Address, ConversationKey, DeliveryStatus, Message, MessageId, MessagePayload, UserId,
};
use rusqlite::params;

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str =
    "id, conversation_key, sender_id, recipient, payload, created_at, status";

impl Database {
    /// Append a message to the log with `status = queued`.
    ///
    /// `members` is the fan-out list for group messages (sender already
    /// excluded); pass an empty slice for private messages. Re-inserting an
    /// existing id fails with [`StoreError::DuplicateId`], which callers
    /// treat as already-persisted.
    pub fn append_message(&self, message: &Message, members: &[UserId]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT INTO messages (id, conversation_key, sender_id, recipient, payload, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                message.id.0 as i64,
                message.conversation.to_column(),
                message.sender.as_str(),
                message.recipient.to_column(),
                serde_json::to_string(&message.payload)?,
                ts_to_sql(&message.created_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicateId(message.id));
            }
            Err(e) => return Err(e.into()),
        }

        for member in members {
            tx.execute(
                "INSERT INTO deliveries (message_id, member_id, status) VALUES (?1, ?2, 0)",
                params![message.id.0 as i64, member.as_str()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Advance `member`'s copy of the message to `delivered`.
    ///
    /// Monotonic: returns `Ok(false)` (not an error) when the message is
    /// unknown or already at or past that status.
    pub fn mark_delivered(&self, id: MessageId, member: &UserId) -> Result<bool> {
        self.advance_status(id, member, DeliveryStatus::Delivered)
    }

    /// Advance `member`'s copy of the message to `read`. Monotonic.
    pub fn mark_read(&self, id: MessageId, member: &UserId) -> Result<bool> {
        self.advance_status(id, member, DeliveryStatus::Read)
    }

    fn advance_status(
        &self,
        id: MessageId,
        member: &UserId,
        target: DeliveryStatus,
    ) -> Result<bool> {
        // Group copy first; falls through to the private row when the
        // message has no per-member delivery entry.
        let advanced = self.conn().execute(
            "UPDATE deliveries SET status = ?1
             WHERE message_id = ?2 AND member_id = ?3 AND status < ?1",
            params![target.as_i64(), id.0 as i64, member.as_str()],
        )?;
        if advanced > 0 {
            return Ok(true);
        }

        let advanced = self.conn().execute(
            "UPDATE messages SET status = ?1
             WHERE id = ?2 AND recipient = ?3 AND status < ?1",
            params![
                target.as_i64(),
                id.0 as i64,
                Address::User(member.clone()).to_column()
            ],
        )?;
        Ok(advanced > 0)
    }

    /// All still-queued messages addressed to `recipient`, in send order
    /// (`created_at` ascending, ties broken by id). The order is
    /// load-bearing: the reconnect flush replays exactly this.
    pub fn list_queued(&self, recipient: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.id, m.conversation_key, m.sender_id, m.recipient, m.payload, m.created_at, m.status
               FROM messages m
              WHERE m.recipient = ?1 AND m.status = 0
             UNION ALL
             SELECT m.id, m.conversation_key, m.sender_id, m.recipient, m.payload, m.created_at, d.status
               FROM messages m
               JOIN deliveries d ON d.message_id = m.id
              WHERE d.member_id = ?2 AND d.status = 0
              ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            params![
                Address::User(recipient.clone()).to_column(),
                recipient.as_str()
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// One page of conversation history, newest page first but ascending
    /// within the page. The cursor is a `(created_at, id)` boundary, so
    /// pages stay stable while new messages are appended concurrently.
    pub fn page_messages(
        &self,
        conversation: &ConversationKey,
        before: Option<PageCursor>,
        limit: u32,
    ) -> Result<(Vec<Message>, Option<PageCursor>)> {
        let limit = limit.max(1) as i64;

        let mut messages = match before {
            Some(cursor) => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                      WHERE conversation_key = ?1
                        AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))
                      ORDER BY created_at DESC, id DESC
                      LIMIT ?4"
                ))?;
                let rows = stmt.query_map(
                    params![
                        conversation.to_column(),
                        ts_to_sql(&cursor.created_at),
                        cursor.id.0 as i64,
                        limit
                    ],
                    row_to_message,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                      WHERE conversation_key = ?1
                      ORDER BY created_at DESC, id DESC
                      LIMIT ?2"
                ))?;
                let rows =
                    stmt.query_map(params![conversation.to_column(), limit], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        let next = if messages.len() as i64 == limit {
            messages.last().map(|m| PageCursor {
                created_at: m.created_at,
                id: m.id,
            })
        } else {
            None
        };

        messages.reverse();
        Ok((messages, next))
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0 as i64],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The status of `member`'s copy: the per-member delivery row for group
    /// messages, otherwise the log row itself.
    pub fn member_status(&self, id: MessageId, member: &UserId) -> Result<DeliveryStatus> {
        let per_member: Option<i64> = self
            .conn()
            .query_row(
                "SELECT status FROM deliveries WHERE message_id = ?1 AND member_id = ?2",
                params![id.0 as i64, member.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let raw = match per_member {
            Some(v) => v,
            None => self
                .conn()
                .query_row(
                    "SELECT status FROM messages WHERE id = ?1",
                    params![id.0 as i64],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                    other => StoreError::Sqlite(other),
                })?,
        };

        DeliveryStatus::from_i64(raw)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid status {raw} for message {id}")))
    }
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let recipient_str: String = row.get(3)?;
    let payload_json: String = row.get(4)?;
    let ts_str: String = row.get(5)?;
    let status_raw: i64 = row.get(6)?;

    let conversation = ConversationKey::parse_column(&conversation_str).ok_or_else(|| {
        invalid_column(1, format!("bad conversation key: {conversation_str}"))
    })?;
    let recipient = Address::parse_column(&recipient_str)
        .ok_or_else(|| invalid_column(3, format!("bad recipient: {recipient_str}")))?;
    let payload: MessagePayload = serde_json::from_str(&payload_json)
        .map_err(|e| invalid_column(4, e.to_string()))?;
    let created_at = ts_from_sql(&ts_str).map_err(|e| invalid_column(5, e.to_string()))?;
    let status = DeliveryStatus::from_i64(status_raw)
        .ok_or_else(|| invalid_column(6, format!("bad status: {status_raw}")))?;

    Ok(Message {
        id: MessageId(id as u64),
        conversation,
        sender: UserId::new(sender),
        recipient,
        payload,
        created_at,
        status,
    })
}

fn invalid_column(index: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        detail.into(),
    )
}
