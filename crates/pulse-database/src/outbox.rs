//! Outbox table queries.
//!
//! Standalone functions over `&Connection` so they compose with pooled
//! connections and with the caller's open transaction alike.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; the equivalent claim
//! mechanism here is a single `UPDATE ... RETURNING` that stamps
//! `locked_by`/`locked_until` on the oldest eligible rows. SQLite's
//! single-writer semantics make the statement atomic, so two workers can
//! never claim the same row, and a crashed worker's claim expires with
//! `locked_until`.

use crate::error::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use pulse_envelope::EventEnvelope;
use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

/// A row of the outbox table.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub tenant_id: String,
    pub aggregate_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Alias used by the reader for rows it currently holds the lock on.
pub type ClaimedRow = OutboxRow;

const ROW_COLUMNS: &str = "id, event_id, event_type, tenant_id, aggregate_id, payload, \
     created_at, processed_at, attempts, last_error, locked_by, locked_until";

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width fractional seconds so SQL string comparison is
    // chronological comparison.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        tenant_id: row.get(3)?,
        aggregate_id: row.get(4)?,
        payload: row.get(5)?,
        created_at: parse_ts(row.get::<_, String>(6)?),
        processed_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        locked_by: row.get(10)?,
        locked_until: row.get::<_, Option<String>>(11)?.map(parse_ts),
    })
}

/// Insert an outbox row for the envelope, inside the caller's transaction.
///
/// Fails with [`DatabaseError::TransactionRequired`] when the connection
/// is in autocommit mode, and with [`DatabaseError::DuplicateEvent`] when
/// a row with this `event_id` already exists.
pub fn insert_outbox_row(conn: &Connection, envelope: &EventEnvelope) -> DatabaseResult<i64> {
    if conn.is_autocommit() {
        return Err(DatabaseError::TransactionRequired);
    }

    let payload = serde_json::to_string(envelope)
        .map_err(|e| DatabaseError::Connection(format!("envelope serialization: {e}")))?;

    let result = conn.execute(
        "INSERT INTO outbox (event_id, event_type, tenant_id, aggregate_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            envelope.event_id.to_string(),
            envelope.event_type,
            envelope.tenant_id,
            envelope.aggregate_id,
            payload,
            fmt_ts(envelope.occurred_at),
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, Some(msg)))
            if e.code == ErrorCode::ConstraintViolation && msg.contains("outbox.event_id") =>
        {
            Err(DatabaseError::DuplicateEvent(envelope.event_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Claim up to `batch_size` unprocessed rows for `worker_id`.
///
/// Rows are claimed in `id` order; only rows whose lock is absent or
/// expired are eligible, which is also how failed rows wait out their
/// backoff (failure pushes `locked_until` into the future).
pub fn claim_batch(
    conn: &Connection,
    worker_id: &str,
    batch_size: usize,
    visibility_timeout: Duration,
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<ClaimedRow>> {
    let locked_until = fmt_ts(now + visibility_timeout);
    let now_str = fmt_ts(now);

    let mut stmt = conn.prepare_cached(&format!(
        "UPDATE outbox
         SET locked_by = ?1, locked_until = ?2
         WHERE id IN (
             SELECT id FROM outbox
             WHERE processed_at IS NULL
               AND (locked_until IS NULL OR locked_until <= ?3)
             ORDER BY id ASC
             LIMIT ?4
         )
         RETURNING {ROW_COLUMNS}"
    ))?;

    let mut rows = stmt
        .query_map(
            params![worker_id, locked_until, now_str, batch_size as i64],
            row_from,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    // RETURNING does not guarantee order; the reader depends on it.
    rows.sort_by_key(|r| r.id);

    if !rows.is_empty() {
        debug!(worker = %worker_id, count = rows.len(), "Claimed outbox batch");
    }

    Ok(rows)
}

/// Mark a row processed after the bus confirmed the append.
pub fn mark_processed(conn: &Connection, id: i64, now: DateTime<Utc>) -> DatabaseResult<()> {
    let changed = conn.execute(
        "UPDATE outbox
         SET processed_at = ?1, locked_by = NULL, locked_until = NULL
         WHERE id = ?2",
        params![fmt_ts(now), id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound(format!("outbox row {id}")));
    }
    Ok(())
}

/// Record a transient failure and push the row's next attempt out by
/// `backoff` (the attempt-indexed delay lands on `locked_until`).
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    backoff: Duration,
    now: DateTime<Utc>,
) -> DatabaseResult<u32> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox
         SET attempts = attempts + 1,
             last_error = ?1,
             locked_by = NULL,
             locked_until = ?2
         WHERE id = ?3
         RETURNING attempts",
    )?;

    let attempts = stmt
        .query_row(params![error, fmt_ts(now + backoff), id], |row| row.get(0))
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DatabaseError::NotFound(format!("outbox row {id}"))
            }
            other => other.into(),
        })?;

    Ok(attempts)
}

/// Terminally mark a row after its envelope was moved to the DLQ.
pub fn mark_dead_lettered(
    conn: &Connection,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    let changed = conn.execute(
        "UPDATE outbox
         SET processed_at = ?1,
             last_error = ?2,
             locked_by = NULL,
             locked_until = NULL
         WHERE id = ?3",
        params![fmt_ts(now), format!("dead-lettered: {reason}"), id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound(format!("outbox row {id}")));
    }
    Ok(())
}

/// Purge processed rows older than `cutoff`. Returns the number purged.
pub fn purge_processed_before(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
    let purged = conn.execute(
        "DELETE FROM outbox WHERE processed_at IS NOT NULL AND processed_at < ?1",
        params![fmt_ts(cutoff)],
    )?;
    Ok(purged)
}

/// Number of unprocessed rows (lag gauge).
pub fn unprocessed_count(conn: &Connection) -> DatabaseResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE processed_at IS NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Insertion time of the oldest unprocessed row, if any (lag gauge).
pub fn oldest_unprocessed_created_at(conn: &Connection) -> DatabaseResult<Option<DateTime<Utc>>> {
    let result = conn.query_row(
        "SELECT created_at FROM outbox WHERE processed_at IS NULL ORDER BY id ASC LIMIT 1",
        [],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(raw) => Ok(Some(parse_ts(raw))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Fetch a row by event id.
pub fn get_by_event_id(conn: &Connection, event_id: &str) -> DatabaseResult<Option<OutboxRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {ROW_COLUMNS} FROM outbox WHERE event_id = ?1"
    ))?;
    let result = stmt.query_row(params![event_id], row_from);
    match result {
        Ok(row) => Ok(Some(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
