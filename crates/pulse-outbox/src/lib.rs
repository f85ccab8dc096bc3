//! Transactional outbox: writer, reader workers, and retention sweep.
//!
//! The writer appends event rows inside the caller's own database
//! transaction, which is what makes event production atomic with the
//! business mutation. Reader workers poll for unprocessed rows, publish
//! them to the stream bus with bounded retries, and quarantine poison
//! rows on the dead-letter stream. The sweeper purges processed rows
//! once the bus has trimmed past the replay window.

pub mod error;
pub mod reader;
pub mod sweeper;
pub mod writer;

pub use error::{OutboxError, OutboxResult};
pub use reader::{OutboxReader, ReaderConfig};
pub use sweeper::{OutboxSweeper, SweeperConfig};
pub use writer::OutboxWriter;
