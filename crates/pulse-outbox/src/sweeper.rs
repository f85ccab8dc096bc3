//! Retention sweep.
//!
//! Processed outbox rows must outlive the stream replay window so a
//! reconnecting client can always be served; once the bus trims past the
//! window the rows are dead weight. The sweeper purges both sides on one
//! cadence.

use crate::error::OutboxResult;
use chrono::Utc;
use pulse_bus::{StreamBus, TrimPolicy};
use pulse_database::{outbox, DatabasePool};
use pulse_envelope::Topic;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep cadence.
    pub interval: Duration,
    /// Retention horizon for processed rows and stream entries.
    pub retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Background retention sweep over the outbox table and the streams.
pub struct OutboxSweeper {
    pool: Arc<DatabasePool>,
    bus: Arc<dyn StreamBus>,
    config: SweeperConfig,
}

impl OutboxSweeper {
    pub fn new(pool: Arc<DatabasePool>, bus: Arc<dyn StreamBus>, config: SweeperConfig) -> Self {
        Self { pool, bus, config }
    }

    /// One sweep pass. Returns the number of purged outbox rows.
    pub async fn sweep_once(&self) -> OutboxResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.retention.as_millis() as i64);

        let purged = {
            let conn = self.pool.get()?;
            outbox::purge_processed_before(&conn, cutoff)?
        };

        let mut trimmed = 0u64;
        for topic in Topic::ALL {
            trimmed += self
                .bus
                .trim(topic, TrimPolicy::MaxAge(self.config.retention))
                .await?;
        }

        if purged > 0 || trimmed > 0 {
            info!(purged, trimmed, "Retention sweep");
        }

        Ok(purged)
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Outbox sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Outbox sweeper shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}
