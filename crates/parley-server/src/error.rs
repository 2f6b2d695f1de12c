use parley_shared::{GroupId, UserId};
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The sending connection has no bound identity.
    #[error("Not authenticated")]
    Unauthenticated,

    /// The addressed user or group does not exist.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Private delivery requires an accepted friendship.
    #[error("No accepted friendship with {0}")]
    NotFriends(UserId),

    /// Senders must belong to the group they address.
    #[error("Not a member of group {0}")]
    NotGroupMember(GroupId),

    /// Conversation history is only served to its own participants.
    #[error("Not a participant in this conversation")]
    NotParticipant,

    #[error("Authentication failed: {0}")]
    Auth(#[from] crate::auth::AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store mutex was poisoned by a panicking task.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, ServerError>;
