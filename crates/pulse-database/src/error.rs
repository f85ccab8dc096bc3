//! Database error types.

use thiserror::Error;

/// Database error type.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error
    #[error("connection error: {0}")]
    Connection(String),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),

    /// Outbox insert attempted outside a live transaction
    #[error("outbox append requires a live transaction")]
    TransactionRequired,

    /// An outbox row with this event_id already exists
    #[error("duplicate event_id: {0}")]
    DuplicateEvent(String),

    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using DatabaseError.
pub type DatabaseResult<T> = Result<T, DatabaseError>;
