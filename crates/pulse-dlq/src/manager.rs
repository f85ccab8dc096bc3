//! Dead-letter queue manager.

use pulse_bus::{BusResult, DlqEntry, StreamBus, Topic};
use pulse_metrics::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// DLQ monitoring configuration.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Alert when a topic's DLQ depth crosses this.
    pub depth_threshold: u64,
    /// Alert when the oldest entry is older than this.
    pub age_threshold: Duration,
    /// Alert when more than this many entries arrive between two checks.
    pub ingress_spike_threshold: u64,
    /// Monitor cadence.
    pub check_interval: Duration,
    /// Cap on entries read per scan.
    pub scan_limit: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            depth_threshold: 100,
            age_threshold: Duration::from_secs(24 * 3600),
            ingress_spike_threshold: 50,
            check_interval: Duration::from_secs(30),
            scan_limit: 1000,
        }
    }
}

/// An alert condition observed on a DLQ topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DlqAlert {
    DepthExceeded { topic: String, depth: u64 },
    AgeExceeded { topic: String, age_seconds: u64 },
    IngressSpike { topic: String, added: u64 },
}

/// Filter for reprocessing a subset of DLQ entries.
#[derive(Debug, Clone, Default)]
pub struct ReprocessFilter {
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
}

impl ReprocessFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(id) = self.event_id {
            if entry.envelope.event_id != id {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &entry.envelope.event_type != event_type {
                return false;
            }
        }
        true
    }
}

/// Outcome of a reprocess call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessReport {
    pub scanned: usize,
    pub reprocessed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Watches the dead-letter streams and reprocesses quarantined events.
pub struct DlqManager {
    bus: Arc<dyn StreamBus>,
    config: DlqConfig,
    metrics: Arc<Metrics>,
    last_depth: Mutex<HashMap<Topic, u64>>,
}

impl DlqManager {
    pub fn new(bus: Arc<dyn StreamBus>, config: DlqConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            bus,
            config,
            metrics,
            last_depth: Mutex::new(HashMap::new()),
        }
    }

    /// List entries on a topic's DLQ, oldest first.
    pub async fn list(&self, topic: Topic, count: usize) -> BusResult<Vec<(String, DlqEntry)>> {
        self.bus.dlq_scan(topic, count).await
    }

    /// Depth of a topic's DLQ.
    pub async fn depth(&self, topic: Topic) -> BusResult<u64> {
        self.bus.dlq_len(topic).await
    }

    /// Age of the oldest quarantined entry on a topic.
    pub async fn oldest_age(&self, topic: Topic) -> BusResult<Option<Duration>> {
        let entries = self.bus.dlq_scan(topic, 1).await?;
        Ok(entries.first().map(|(_, entry)| {
            let age = chrono::Utc::now() - entry.first_failed_at;
            age.to_std().unwrap_or(Duration::ZERO)
        }))
    }

    /// Evaluate alert conditions across all topics and update the
    /// `dlq_depth` gauge.
    pub async fn check_alerts(&self) -> BusResult<Vec<DlqAlert>> {
        let mut alerts = Vec::new();

        for topic in Topic::ALL {
            let depth = self.bus.dlq_len(topic).await?;
            self.metrics.dlq_depth.set(topic.as_str(), depth as f64);

            let previous = {
                let mut last = self.last_depth.lock().expect("lock poisoned");
                last.insert(topic, depth).unwrap_or(depth)
            };

            if depth > self.config.depth_threshold {
                alerts.push(DlqAlert::DepthExceeded {
                    topic: topic.to_string(),
                    depth,
                });
            }

            let added = depth.saturating_sub(previous);
            if added > self.config.ingress_spike_threshold {
                alerts.push(DlqAlert::IngressSpike {
                    topic: topic.to_string(),
                    added,
                });
            }

            if depth > 0 {
                if let Some(age) = self.oldest_age(topic).await? {
                    if age > self.config.age_threshold {
                        alerts.push(DlqAlert::AgeExceeded {
                            topic: topic.to_string(),
                            age_seconds: age.as_secs(),
                        });
                    }
                }
            }
        }

        Ok(alerts)
    }

    /// Reprocess filter-matched entries: re-append the envelope to its
    /// origin topic with attempts reset, then remove the DLQ entry.
    ///
    /// `fixed_payload` replaces the payload of every matched entry; it is
    /// meant for single-entry repair together with an `event_id` filter.
    pub async fn reprocess(
        &self,
        topic: Topic,
        filter: &ReprocessFilter,
        limit: usize,
        fixed_payload: Option<serde_json::Value>,
    ) -> BusResult<ReprocessReport> {
        let entries = self.bus.dlq_scan(topic, limit).await?;
        let mut report = ReprocessReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for (stream_id, entry) in entries {
            if !filter.matches(&entry) {
                report.skipped += 1;
                continue;
            }

            let mut envelope = entry.envelope.clone();
            if let Some(payload) = &fixed_payload {
                envelope.payload = payload.clone();
            }

            match self.bus.append(topic, &envelope).await {
                Ok(new_id) => {
                    self.bus.dlq_delete(topic, &stream_id).await?;
                    report.reprocessed += 1;
                    info!(
                        topic = %topic,
                        event_id = %envelope.event_id,
                        dlq_id = %stream_id,
                        stream_id = %new_id,
                        "Reprocessed DLQ entry"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        topic = %topic,
                        event_id = %envelope.event_id,
                        error = %e,
                        "Failed to reprocess DLQ entry, leaving it quarantined"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Monitor loop: check alert conditions on a fixed cadence until
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.check_interval.as_secs(),
            "DLQ monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DLQ monitor shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.check_alerts().await {
                        Ok(alerts) => {
                            for alert in &alerts {
                                warn!(alert = ?alert, "DLQ alert");
                            }
                        }
                        Err(e) => warn!(error = %e, "DLQ check failed"),
                    }
                }
            }
        }
    }
}
