use thiserror::Error;

/// Errors raised by the storage collections.
///
/// Only a failure while appending to the message log is fatal for a send;
/// everywhere else these are absorbed by the orchestrator and reported
/// through its sink.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },

    /// Input rejected before anything was written.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Backend refused the write; used by wrappers that simulate an outage.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<crate::validation::ValidationError> for PersistenceError {
    fn from(err: crate::validation::ValidationError) -> Self {
        PersistenceError::Invalid(err.to_string())
    }
}

/// Errors for user-initiated conversation commands (clear, mark read).
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The mailbox belongs to somebody else.
    #[error("mailbox {mailbox_id} is not owned by {user_id}")]
    NotOwner { mailbox_id: String, user_id: String },

    /// Room membership rules rejected the request.
    #[error("room {room_id}: {reason}")]
    Room { room_id: String, reason: String },
}

/// Why a real-time push to one member did not happen. Expected and never
/// fatal: the stored mailbox and counter already reflect the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("user {0} has no open channel")]
    Offline(String),

    #[error("channel of user {0} is backlogged")]
    Backlogged(String),

    #[error("channel of user {0} was closed")]
    Closed(String),

    #[error("payload encoding failed: {0}")]
    Encoding(String),
}
