use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snowflake::MessageId;

// User identity: an opaque unique key assigned at registration.
// The key is immutable; only the display name may change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a message is addressed: a single user or a whole group.
/// Fixed at creation time, never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    User(UserId),
    Group(GroupId),
}

impl Address {
    /// Stable textual form used as a SQL column value (`u:<id>` / `g:<uuid>`).
    pub fn to_column(&self) -> String {
        match self {
            Address::User(u) => format!("u:{}", u.0),
            Address::Group(g) => format!("g:{}", g.0),
        }
    }

    pub fn parse_column(s: &str) -> Option<Self> {
        let (kind, rest) = s.split_once(':')?;
        match kind {
            "u" => Some(Address::User(UserId::new(rest))),
            "g" => Uuid::parse_str(rest).ok().map(|u| Address::Group(GroupId(u))),
            _ => None,
        }
    }
}

/// Deterministic conversation identifier.
///
/// For a private pair the two participants are canonically ordered, so the
/// key computed from (A, B) and from (B, A) is identical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct(UserId, UserId),
    Group(GroupId),
}

impl ConversationKey {
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            ConversationKey::Direct(a.clone(), b.clone())
        } else {
            ConversationKey::Direct(b.clone(), a.clone())
        }
    }

    pub fn group(g: GroupId) -> Self {
        ConversationKey::Group(g)
    }

    /// The key for a message from `sender` to `recipient`.
    pub fn for_message(sender: &UserId, recipient: &Address) -> Self {
        match recipient {
            Address::User(u) => Self::direct(sender, u),
            Address::Group(g) => Self::group(*g),
        }
    }

    /// Stable textual form used as a SQL column value.
    pub fn to_column(&self) -> String {
        match self {
            ConversationKey::Direct(a, b) => format!("d:{}:{}", a.0, b.0),
            ConversationKey::Group(g) => format!("g:{}", g.0),
        }
    }

    pub fn parse_column(s: &str) -> Option<Self> {
        let (kind, rest) = s.split_once(':')?;
        match kind {
            "d" => {
                let (a, b) = rest.split_once(':')?;
                Some(ConversationKey::Direct(UserId::new(a), UserId::new(b)))
            }
            "g" => Uuid::parse_str(rest)
                .ok()
                .map(|u| ConversationKey::Group(GroupId(u))),
            _ => None,
        }
    }
}

/// Server-observed delivery lifecycle of a message.
///
/// Transitions only move forward: queued -> delivered -> read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryStatus {
    Queued,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            DeliveryStatus::Queued => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(DeliveryStatus::Queued),
            1 => Some(DeliveryStatus::Delivered),
            2 => Some(DeliveryStatus::Read),
            _ => None,
        }
    }
}

/// Client-side view of the client's own send attempt, independent of the
/// server-observed [`DeliveryStatus`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientStatus {
    Sending,
    Sent,
    Failed,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientStatus::Sending => "sending",
            ClientStatus::Sent => "sent",
            ClientStatus::Failed => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(ClientStatus::Sending),
            "sent" => Some(ClientStatus::Sent),
            "fail" => Some(ClientStatus::Failed),
            _ => None,
        }
    }
}

/// Message body: inline text or a file descriptor.
///
/// For files only the locator and metadata travel in the envelope; the
/// upload/download mechanics live outside the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    File {
        name: String,
        size: u64,
        locator: String,
        mime: String,
    },
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Producer-generated snowflake id; the dedup key. Never reused.
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender: UserId,
    pub recipient: Address,
    pub payload: MessagePayload,
    /// Producer-assigned, millisecond resolution; the ordering key
    /// (ties broken by `id`).
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

/// Friendship edge between two identities; gates private delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friendship {
    pub requester: UserId,
    pub addressee: UserId,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_is_symmetric() {
        let a = UserId::new("0000000042");
        let b = UserId::new("0000000007");
        assert_eq!(ConversationKey::direct(&a, &b), ConversationKey::direct(&b, &a));
    }

    #[test]
    fn conversation_key_column_round_trip() {
        let key = ConversationKey::direct(&UserId::new("a"), &UserId::new("b"));
        assert_eq!(ConversationKey::parse_column(&key.to_column()), Some(key));

        let gkey = ConversationKey::group(GroupId::new());
        assert_eq!(ConversationKey::parse_column(&gkey.to_column()), Some(gkey));
    }

    #[test]
    fn address_column_round_trip() {
        let u = Address::User(UserId::new("0000000001"));
        assert_eq!(Address::parse_column(&u.to_column()), Some(u));

        let g = Address::Group(GroupId::new());
        assert_eq!(Address::parse_column(&g.to_column()), Some(g));
    }

    #[test]
    fn delivery_status_orders_forward() {
        assert!(DeliveryStatus::Queued < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::from_i64(1), Some(DeliveryStatus::Delivered));
        assert_eq!(DeliveryStatus::from_i64(9), None);
    }
}
