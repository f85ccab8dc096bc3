//! Push layer error types.

use thiserror::Error;
use uuid::Uuid;

/// Push error type.
#[derive(Error, Debug)]
pub enum PushError {
    /// No live connection with this id
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),

    /// Handshake credential rejected
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),

    /// Stream bus error during replay
    #[error(transparent)]
    Bus(#[from] pulse_bus::BusError),
}

/// Result type for push operations.
pub type PushResult<T> = Result<T, PushError>;
