//! Outbox writer.

use crate::error::{OutboxError, OutboxResult};
use pulse_database::{outbox, DatabaseError};
use pulse_envelope::{EventEnvelope, SchemaRegistry};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::debug;

/// Appends event rows inside the caller's transaction.
///
/// The single contract that makes the pipeline reliable: the insert
/// happens on the same connection, inside the same transaction, as the
/// business mutation. The event exists iff the business change commits.
pub struct OutboxWriter {
    registry: Arc<SchemaRegistry>,
}

impl OutboxWriter {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Append one outbox row for `envelope` inside the caller's open
    /// transaction. Returns the row id.
    ///
    /// Errors:
    /// - [`DatabaseError::TransactionRequired`] when `conn` is in
    ///   autocommit mode (no live transaction),
    /// - [`OutboxError::Validation`] when the payload does not match its
    ///   registered schema,
    /// - [`DatabaseError::DuplicateEvent`] when the `event_id` was
    ///   already appended (a caller bug).
    pub fn append(&self, conn: &Connection, envelope: &EventEnvelope) -> OutboxResult<i64> {
        if conn.is_autocommit() {
            return Err(DatabaseError::TransactionRequired.into());
        }

        self.registry.validate(envelope)?;

        let row_id = outbox::insert_outbox_row(conn, envelope)?;
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            tenant_id = %envelope.tenant_id,
            row_id,
            "Appended outbox row"
        );

        Ok(row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_database::outbox::{get_by_event_id, unprocessed_count};
    use pulse_database::{DatabasePool, PoolConfig};
    use serde_json::json;

    fn test_pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(&dir.path().join("outbox.db"), PoolConfig::default()).unwrap();
        (dir, pool)
    }

    fn writer() -> OutboxWriter {
        OutboxWriter::new(Arc::new(SchemaRegistry::with_builtin_schemas()))
    }

    fn order_envelope() -> EventEnvelope {
        EventEnvelope::new(
            "order_created",
            1,
            "tenant-1",
            "order-1",
            "pulse-api",
            json!({"items": [{"sku": "S", "quantity": 1}], "total_minor_units": 2998, "currency": "EUR"}),
        )
    }

    #[test]
    fn test_append_inside_transaction() {
        let (_dir, pool) = test_pool();
        let writer = writer();
        let env = order_envelope();

        let conn = pool.get().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        writer.append(&tx, &env).unwrap();
        tx.commit().unwrap();

        assert_eq!(unprocessed_count(&conn).unwrap(), 1);
        let row = get_by_event_id(&conn, &env.event_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(row.tenant_id, "tenant-1");
        assert_eq!(row.event_type, "order_created");
    }

    #[test]
    fn test_append_outside_transaction_fails() {
        let (_dir, pool) = test_pool();
        let writer = writer();
        let conn = pool.get().unwrap();

        match writer.append(&conn, &order_envelope()) {
            Err(OutboxError::Database(DatabaseError::TransactionRequired)) => {}
            other => panic!("expected TransactionRequired, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_append_rejects_invalid_payload() {
        let (_dir, pool) = test_pool();
        let writer = writer();

        let mut env = order_envelope();
        env.payload = json!({"total_minor_units": "not-a-number"});

        let conn = pool.get().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        match writer.append(&tx, &env) {
            Err(OutboxError::Validation(_)) => {}
            other => panic!("expected validation error, got {:?}", other.err()),
        }
        // Nothing was inserted.
        tx.commit().unwrap();
        assert_eq!(unprocessed_count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_append_rejects_unknown_event_type() {
        let (_dir, pool) = test_pool();
        let writer = writer();

        let mut env = order_envelope();
        env.event_type = "mystery_event".to_string();

        let conn = pool.get().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        assert!(matches!(
            writer.append(&tx, &env),
            Err(OutboxError::Validation(
                pulse_envelope::EnvelopeError::UnknownSchema { .. }
            ))
        ));
    }

    #[test]
    fn test_append_duplicate_event_id() {
        let (_dir, pool) = test_pool();
        let writer = writer();
        let env = order_envelope();

        let conn = pool.get().unwrap();
        let tx = conn.unchecked_transaction().unwrap();
        writer.append(&tx, &env).unwrap();
        tx.commit().unwrap();

        let tx = conn.unchecked_transaction().unwrap();
        assert!(matches!(
            writer.append(&tx, &env),
            Err(OutboxError::Database(DatabaseError::DuplicateEvent(_)))
        ));
    }

    #[test]
    fn test_rollback_discards_event() {
        let (_dir, pool) = test_pool();
        let writer = writer();
        let env = order_envelope();

        let conn = pool.get().unwrap();
        {
            let tx = conn.unchecked_transaction().unwrap();
            writer.append(&tx, &env).unwrap();
            // Dropped without commit.
        }

        assert_eq!(unprocessed_count(&conn).unwrap(), 0);
    }
}
