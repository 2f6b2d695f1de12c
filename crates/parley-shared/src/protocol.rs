use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snowflake::MessageId;
use crate::types::{Address, ConversationKey, Message, MessagePayload, UserId};

/// Paging cursor: a timestamp boundary plus the id tie-breaker, so pages
/// stay stable while new messages are appended to the same conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

/// Frames the client sends to the relay over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Present a credential or token; the relay resolves it to an identity.
    Authenticate { credential: String },

    /// Produce a message. The id and timestamp are minted by the client.
    Send {
        id: MessageId,
        to: Address,
        payload: MessagePayload,
        created_at: DateTime<Utc>,
    },

    /// The recipient has displayed the message.
    MarkRead { id: MessageId },

    /// Scroll-back request for one conversation.
    LoadPage {
        conversation: ConversationKey,
        before: Option<PageCursor>,
        limit: u32,
    },

    AddFriend { user: UserId },
    AcceptFriend { user: UserId },

    CreateGroup { name: String },
    JoinGroup { group: crate::types::GroupId },
}

/// Acknowledgment level for a send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    /// Persisted; the recipient was offline, delivery will happen on their
    /// next connect.
    Stored,
    /// Pushed to the recipient's live connection.
    Delivered,
}

/// Frames the relay pushes to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerFrame {
    AuthOk { user: UserId },
    AuthErr { reason: String },

    NewMessage(Message),
    MessageAck { id: MessageId, status: AckStatus },

    /// This session was superseded by a newer login for the same identity.
    ForcedLogout { reason: String },

    /// Which of the user's friends are currently online.
    ContactsOnline { online: Vec<UserId> },

    Page {
        conversation: ConversationKey,
        messages: Vec<Message>,
        /// Boundary for the next (older) page, absent on the last page.
        next: Option<PageCursor>,
    },

    GroupCreated { group: crate::types::GroupId },

    Error { message: String },
}

impl ClientFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl ServerFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryStatus;

    #[test]
    fn client_frame_round_trip() {
        let frame = ClientFrame::Send {
            id: MessageId(12345),
            to: Address::User(UserId::new("0000000002")),
            payload: MessagePayload::Text("salut".into()),
            created_at: Utc::now(),
        };

        let bytes = frame.to_bytes().unwrap();
        let restored = ClientFrame::from_bytes(&bytes).unwrap();

        match restored {
            ClientFrame::Send { id, payload, .. } => {
                assert_eq!(id, MessageId(12345));
                assert_eq!(payload, MessagePayload::Text("salut".into()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_frame_round_trip() {
        let sender = UserId::new("0000000001");
        let recipient = UserId::new("0000000002");
        let frame = ServerFrame::NewMessage(Message {
            id: MessageId(99),
            conversation: ConversationKey::direct(&sender, &recipient),
            sender,
            recipient: Address::User(recipient),
            payload: MessagePayload::File {
                name: "report.pdf".into(),
                size: 4096,
                locator: "blob://abc".into(),
                mime: "application/pdf".into(),
            },
            created_at: Utc::now(),
            status: DeliveryStatus::Queued,
        });

        let bytes = frame.to_bytes().unwrap();
        let restored = ServerFrame::from_bytes(&bytes).unwrap();

        match restored {
            ServerFrame::NewMessage(m) => assert_eq!(m.id, MessageId(99)),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
