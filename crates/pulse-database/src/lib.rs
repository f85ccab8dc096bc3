//! Relational store for the transactional outbox.
//!
//! A thin SQLite layer: a pooled connection manager with WAL mode, a
//! versioned migrations module, and the outbox claim/mark/purge queries
//! the writer and reader workers run. Query functions take a
//! `&Connection` so they work against both pooled and caller-owned
//! connections (and against the caller's open transaction, which is how
//! the writer joins the business commit).

pub mod error;
pub mod migrations;
pub mod outbox;
pub mod pool;

pub use error::{DatabaseError, DatabaseResult};
pub use outbox::{ClaimedRow, OutboxRow};
pub use pool::{DatabasePool, PoolConfig};
