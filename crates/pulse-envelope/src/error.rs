//! Envelope and schema error types.

use thiserror::Error;

/// Envelope error type.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// No schema registered for this event type and version
    #[error("no schema registered for {event_type} v{schema_version}")]
    UnknownSchema {
        event_type: String,
        schema_version: u32,
    },

    /// Payload does not match its registered schema
    #[error("schema mismatch on field '{field}': {reason}")]
    SchemaMismatch { field: String, reason: String },

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
