//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Envelope failed schema validation
    #[error("validation error: {0}")]
    Validation(#[from] pulse_envelope::EnvelopeError),

    /// Database error (includes the transaction and duplicate contracts)
    #[error(transparent)]
    Database(#[from] pulse_database::DatabaseError),

    /// Stream bus error
    #[error(transparent)]
    Bus(#[from] pulse_bus::BusError),
}

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;
