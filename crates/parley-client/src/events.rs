//! Events the reconciler surfaces to the UI layer.

use parley_shared::protocol::PageCursor;
use parley_shared::{ClientStatus, ConversationKey, GroupId, Message, MessageId, UserId};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The relay accepted our credential.
    Authenticated(UserId),
    AuthFailed(String),

    /// A message from someone else (or another device) to render.
    NewMessage(Message),

    /// One of our own send attempts changed state.
    MessageStatus { id: MessageId, status: ClientStatus },

    ContactsOnline(Vec<UserId>),

    /// A history page arrived and has been merged into the cache.
    PageLoaded {
        conversation: ConversationKey,
        messages: Vec<Message>,
        next: Option<PageCursor>,
    },

    GroupCreated(GroupId),

    /// Another connection took over our identity.
    ForcedLogout(String),

    /// The relay rejected a frame we sent.
    Rejected(String),
}

/// Fire-and-forget event emitter. A closed receiver means the UI is gone;
/// dropping the event is the only sensible outcome.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: ClientEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped, discarding event");
        }
    }
}
