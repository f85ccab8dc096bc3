//! Outbox reader worker.
//!
//! Claims unprocessed rows in insert order, publishes them to the stream
//! bus, and records the outcome. Rows that fail transiently wait out an
//! attempt-indexed full-jitter backoff on `locked_until`; rows that
//! exhaust `max_attempts` (or carry a poison payload) move to the
//! dead-letter stream and are terminally marked.
//!
//! Multiple readers may run concurrently: the row claim is exclusive, and
//! a crashed worker's claims expire with the visibility timeout. A claim
//! is never held across a bus call on the same connection; the claim
//! statement commits before the append starts.

use crate::error::OutboxResult;
use chrono::Utc;
use pulse_bus::{stream_key, DlqEntry, StreamBus};
use pulse_database::outbox::{self, ClaimedRow};
use pulse_database::DatabasePool;
use pulse_dlq::full_jitter_backoff;
use pulse_envelope::{EventEnvelope, SchemaRegistry};
use pulse_metrics::Metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reader worker configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Poll cadence when the outbox is drained.
    pub poll_interval: Duration,
    /// Rows claimed per batch.
    pub batch_size: usize,
    /// How long a claim shields a row from other workers.
    pub visibility_timeout: Duration,
    /// Attempts before an envelope is dead-lettered.
    pub max_attempts: u32,
    /// Backoff base.
    pub retry_base: Duration,
    /// Backoff cap.
    pub retry_cap: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 8,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
        }
    }
}

enum RowOutcome {
    Published,
    Retried,
    DeadLettered,
}

/// Polling publisher from the outbox table to the stream bus.
pub struct OutboxReader {
    pool: Arc<DatabasePool>,
    bus: Arc<dyn StreamBus>,
    registry: Arc<SchemaRegistry>,
    metrics: Arc<Metrics>,
    config: ReaderConfig,
    worker_id: String,
}

impl OutboxReader {
    pub fn new(
        pool: Arc<DatabasePool>,
        bus: Arc<dyn StreamBus>,
        registry: Arc<SchemaRegistry>,
        metrics: Arc<Metrics>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            registry,
            metrics,
            config,
            worker_id: format!("reader-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run the polling loop until shutdown. The in-flight batch finishes
    /// before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.worker_id,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox reader started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker = %self.worker_id, "Outbox reader shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_once().await {
                        error!(worker = %self.worker_id, error = %e, "Outbox batch failed");
                        // Database or bus trouble: back off before the
                        // next poll instead of spinning.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Claim and process one batch. Returns the number published.
    pub async fn process_once(&self) -> OutboxResult<usize> {
        let rows = {
            let conn = self.pool.get()?;
            outbox::claim_batch(
                &conn,
                &self.worker_id,
                self.config.batch_size,
                to_chrono(self.config.visibility_timeout),
                Utc::now(),
            )?
            // The pooled connection drops here; the bus never sees a
            // held row claim transaction.
        };

        let mut published = 0;
        for row in rows {
            match self.process_row(row).await? {
                RowOutcome::Published => published += 1,
                // Terminal: the pipeline resumes with the next row.
                RowOutcome::DeadLettered => continue,
                // Retriable failures stop the batch so a later event of
                // the same aggregate cannot overtake this one.
                RowOutcome::Retried => break,
            }
        }

        self.update_lag()?;
        Ok(published)
    }

    async fn process_row(&self, row: ClaimedRow) -> OutboxResult<RowOutcome> {
        let envelope = match EventEnvelope::from_json(&row.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // The row cannot even be parsed; no number of retries
                // will fix it.
                warn!(
                    worker = %self.worker_id,
                    row_id = row.id,
                    event_id = %row.event_id,
                    error = %e,
                    "Poison outbox payload"
                );
                let envelope = poison_envelope(&row);
                return self
                    .dead_letter(&row, envelope, format!("poison payload: {e}"))
                    .await;
            }
        };

        if let Err(e) = self.registry.validate(&envelope) {
            return self.fail(&row, envelope, format!("validation: {e}")).await;
        }

        let started = Instant::now();
        match self.bus.append(envelope.topic(), &envelope).await {
            Ok(stream_id) => {
                self.metrics
                    .bus_append_duration_seconds
                    .observe(started.elapsed().as_secs_f64());

                let conn = self.pool.get()?;
                outbox::mark_processed(&conn, row.id, Utc::now())?;
                self.metrics.events_produced_total.inc();

                debug!(
                    worker = %self.worker_id,
                    event_id = %envelope.event_id,
                    stream_id = %stream_id,
                    "Published outbox row"
                );
                Ok(RowOutcome::Published)
            }
            Err(e) => {
                self.fail(&row, envelope, format!("bus append: {e}")).await
            }
        }
    }

    async fn fail(
        &self,
        row: &ClaimedRow,
        envelope: EventEnvelope,
        reason: String,
    ) -> OutboxResult<RowOutcome> {
        let next_attempts = row.attempts + 1;

        if next_attempts >= self.config.max_attempts {
            return self.dead_letter(row, envelope, reason).await;
        }

        let backoff = full_jitter_backoff(row.attempts, self.config.retry_base, self.config.retry_cap);
        let conn = self.pool.get()?;
        outbox::mark_failed(&conn, row.id, &reason, to_chrono(backoff), Utc::now())?;

        warn!(
            worker = %self.worker_id,
            row_id = row.id,
            event_id = %row.event_id,
            attempts = next_attempts,
            backoff_ms = backoff.as_millis() as u64,
            reason = %reason,
            "Outbox row will retry"
        );

        Ok(RowOutcome::Retried)
    }

    async fn dead_letter(
        &self,
        row: &ClaimedRow,
        envelope: EventEnvelope,
        reason: String,
    ) -> OutboxResult<RowOutcome> {
        let topic = envelope.topic();
        let entry = DlqEntry {
            envelope,
            first_failed_at: Utc::now(),
            last_error: reason.clone(),
            attempt_count: row.attempts + 1,
            origin_stream: stream_key(topic),
            origin_id: None,
        };

        // If the dead-letter append itself fails the row keeps its
        // claim and is retried after the visibility timeout.
        self.bus.dead_letter(topic, &entry).await?;

        let conn = self.pool.get()?;
        outbox::mark_dead_lettered(&conn, row.id, &reason, Utc::now())?;
        self.metrics.events_dead_lettered_total.inc();

        Ok(RowOutcome::DeadLettered)
    }

    fn update_lag(&self) -> OutboxResult<()> {
        let conn = self.pool.get()?;
        let lag = match outbox::oldest_unprocessed_created_at(&conn)? {
            Some(oldest) => (Utc::now() - oldest).num_milliseconds().max(0) as f64 / 1000.0,
            None => 0.0,
        };
        self.metrics.outbox_lag_seconds.set(lag);
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

/// Stand-in envelope for a row whose payload no longer parses; carries
/// the row's identity and the raw payload for forensics.
fn poison_envelope(row: &ClaimedRow) -> EventEnvelope {
    EventEnvelope {
        event_id: Uuid::parse_str(&row.event_id).unwrap_or_else(|_| Uuid::new_v4()),
        event_type: row.event_type.clone(),
        schema_version: 0,
        tenant_id: row.tenant_id.clone(),
        aggregate_id: row.aggregate_id.clone(),
        occurred_at: row.created_at,
        producer: "unknown".to_string(),
        trace_id: None,
        user_id: None,
        payload: serde_json::Value::String(row.payload.clone()),
    }
}
