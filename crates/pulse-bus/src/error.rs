//! Bus error types.

use thiserror::Error;

/// Bus error type.
#[derive(Error, Debug)]
pub enum BusError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Bus operation exceeded its deadline
    #[error("bus operation timed out: {0}")]
    Timeout(&'static str),

    /// Unexpected reply shape from the stream server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A stream entry whose payload does not deserialize
    #[error("undecodable entry {stream_id}: {source}")]
    Entry {
        stream_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
