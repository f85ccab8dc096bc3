//! Canonical event envelope and schema registry.
//!
//! Every event that crosses the outbox, the stream bus, or a push
//! connection travels inside an [`EventEnvelope`]. The envelope is the
//! stable wire contract; payloads stay opaque JSON at the transport layer
//! and are validated against a [`SchemaRegistry`] only at the edges
//! (outbox write, reader publish).

pub mod envelope;
pub mod error;
pub mod schema;

pub use envelope::{EventEnvelope, Topic};
pub use error::{EnvelopeError, EnvelopeResult};
pub use schema::{FieldKind, FieldSpec, PayloadSchema, SchemaRegistry};
