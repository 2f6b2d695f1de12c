use parley_shared::MessageId;
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The outbound frame channel is gone; the connection task has exited.
    #[error("Connection closed")]
    TransportClosed,

    /// Only failed attempts may be retried.
    #[error("Message {0} is not in a failed state")]
    NotFailed(MessageId),

    /// The cache mutex was poisoned by a panicking task.
    #[error("Cache lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, ClientError>;
