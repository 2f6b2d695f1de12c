use parley_shared::MessageId;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A message with this id is already stored. Callers treat this as
    /// already-persisted, not as a user-visible failure.
    #[error("Message {0} already stored")]
    DuplicateId(MessageId),

    /// Migration failure, or schema state inconsistent with what this
    /// build supports.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored value could not be decoded back into its domain type.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// JSON (payload) encoding error.
    #[error("Payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
