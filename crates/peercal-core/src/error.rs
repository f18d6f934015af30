//! Error types for the peercal room engine

use thiserror::Error;

/// Main error type for room, log, and pairing operations
#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    #[error("Not writable: {0}")]
    NotWritable(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room closed: {0}")]
    RoomClosed(String),

    #[error("Pairing error: {0}")]
    Pairing(String),

    #[error("Gossip error: {0}")]
    Gossip(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Replay error: {0}")]
    Replay(String),

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for room operations
pub type RoomResult<T> = Result<T, RoomError>;
