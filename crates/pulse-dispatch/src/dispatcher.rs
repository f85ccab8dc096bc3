//! Per-tenant dispatcher loop.

use crate::dedup::DedupRing;
use pulse_bus::{BusResult, StreamBus, StreamEntry};
use pulse_envelope::{SchemaRegistry, Topic};
use pulse_metrics::Metrics;
use pulse_push::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Acknowledgement policy for dispatched entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack once the entry has been offered to every matching live
    /// connection, even if some enqueues failed.
    BestEffort,
    /// Ack only when every matching live connection accepted the frame;
    /// otherwise the entry stays pending and is redelivered via the
    /// stale claim.
    AllConnected,
}

impl AckPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "best_effort" => Some(AckPolicy::BestEffort),
            "all_connected" => Some(AckPolicy::AllConnected),
            _ => None,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Consumer group prefix; the group is `{prefix}-{tenant_id}`.
    pub group_prefix: String,
    /// Topics every tenant loop consumes.
    pub topics: Vec<Topic>,
    /// Entries per blocking read.
    pub read_count: usize,
    /// Blocking read timeout.
    pub block_ms: u64,
    pub ack_policy: AckPolicy,
    /// Shut the loop down after the tenant has had no connections for
    /// this long.
    pub idle_shutdown: Duration,
    /// How often to reclaim entries from dead consumers.
    pub claim_interval: Duration,
    /// Pending idle time before an entry counts as stale.
    pub min_idle: Duration,
    /// De-dup ring capacity.
    pub dedup_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            group_prefix: "notifier".to_string(),
            topics: Topic::ALL.to_vec(),
            read_count: 20,
            block_ms: 1000,
            ack_policy: AckPolicy::BestEffort,
            idle_shutdown: Duration::from_secs(300),
            claim_interval: Duration::from_secs(30),
            min_idle: Duration::from_secs(60),
            dedup_capacity: 1024,
        }
    }
}

/// Consumer loop for one tenant's group.
pub struct TenantDispatcher {
    tenant_id: String,
    group: String,
    consumer: String,
    bus: Arc<dyn StreamBus>,
    registry: Arc<ConnectionRegistry>,
    schemas: Arc<SchemaRegistry>,
    metrics: Arc<Metrics>,
    config: DispatchConfig,
}

impl TenantDispatcher {
    pub fn new(
        tenant_id: impl Into<String>,
        bus: Arc<dyn StreamBus>,
        registry: Arc<ConnectionRegistry>,
        schemas: Arc<SchemaRegistry>,
        metrics: Arc<Metrics>,
        config: DispatchConfig,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let group = format!("{}-{}", config.group_prefix, tenant_id);
        let consumer = format!("dispatcher-{}", Uuid::new_v4());
        Self {
            tenant_id,
            group,
            consumer,
            bus,
            registry,
            schemas,
            metrics,
            config,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Run until shutdown or idle expiry. The in-flight batch is always
    /// finished before exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self
            .bus
            .ensure_group(&self.group, &self.config.topics)
            .await
        {
            error!(group = %self.group, error = %e, "Failed to create consumer group");
            return;
        }

        info!(
            tenant_id = %self.tenant_id,
            group = %self.group,
            consumer = %self.consumer,
            "Dispatcher started"
        );

        let mut dedup = DedupRing::new(self.config.dedup_capacity);
        let mut last_claim = Instant::now();
        let mut idle_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(tenant_id = %self.tenant_id, "Dispatcher shutting down");
                        break;
                    }
                }
                result = self.bus.read(
                    &self.group,
                    &self.consumer,
                    &self.config.topics,
                    self.config.read_count,
                    self.config.block_ms,
                ) => {
                    match result {
                        Ok(entries) => {
                            for entry in entries {
                                self.handle_entry(&mut dedup, entry).await;
                            }
                        }
                        Err(e) => {
                            warn!(
                                tenant_id = %self.tenant_id,
                                error = %e,
                                "Dispatcher read failed"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }

            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                self.claim_round(&mut dedup).await;
                self.update_lag().await;
            }

            // Idle shutdown: no connections for the grace period.
            if self.registry.tenant_connection_count(&self.tenant_id) == 0 {
                let since = idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.idle_shutdown {
                    info!(
                        tenant_id = %self.tenant_id,
                        idle_secs = self.config.idle_shutdown.as_secs(),
                        "No connections, dispatcher stopping"
                    );
                    break;
                }
            } else {
                idle_since = None;
            }
        }

        self.metrics.stream_consumer_lag.remove(&self.tenant_id);
    }

    async fn handle_entry(&self, dedup: &mut DedupRing, entry: StreamEntry) {
        // Streams are topic-scoped, not tenant-scoped; foreign entries
        // are expected and simply acked past.
        if entry.envelope.tenant_id != self.tenant_id {
            self.ack_quietly(&entry).await;
            return;
        }

        // Consumer-side de-dup absorbs the reader's at-most-one
        // duplicate and stale-claim redeliveries.
        if !dedup.insert(entry.envelope.event_id) {
            debug!(
                tenant_id = %self.tenant_id,
                event_id = %entry.envelope.event_id,
                "Duplicate entry suppressed"
            );
            self.ack_quietly(&entry).await;
            return;
        }

        if !self
            .schemas
            .contains(&entry.envelope.event_type, entry.envelope.schema_version)
        {
            // Unknown on read is forwarded untouched.
            debug!(
                event_type = %entry.envelope.event_type,
                schema_version = entry.envelope.schema_version,
                "Unknown event type, forwarding as-is"
            );
        }

        let outcome = self.registry.dispatch(&entry).await;
        self.metrics.events_consumed_total.inc();

        let ack = match self.config.ack_policy {
            AckPolicy::BestEffort => true,
            AckPolicy::AllConnected => outcome.failed == 0,
        };

        if ack {
            self.ack_quietly(&entry).await;
        } else {
            debug!(
                tenant_id = %self.tenant_id,
                stream_id = %entry.stream_id,
                failed = outcome.failed,
                "Leaving entry pending for redelivery"
            );
        }
    }

    /// Reclaim entries stuck with dead consumers and run them through
    /// the normal path (the de-dup ring keeps redeliveries harmless).
    async fn claim_round(&self, dedup: &mut DedupRing) {
        for topic in &self.config.topics {
            match self
                .bus
                .claim_stale(&self.group, &self.consumer, *topic, self.config.min_idle)
                .await
            {
                Ok(entries) => {
                    for entry in entries {
                        self.handle_entry(dedup, entry).await;
                    }
                }
                Err(e) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        topic = %topic,
                        error = %e,
                        "Stale claim failed"
                    );
                }
            }
        }
    }

    async fn update_lag(&self) {
        let mut pending_total = 0usize;
        for topic in &self.config.topics {
            if let Ok(pending) = self.bus.pending(&self.group, *topic).await {
                pending_total += pending.len();
            }
        }
        self.metrics
            .stream_consumer_lag
            .set(&self.tenant_id, pending_total as f64);
    }

    async fn ack_quietly(&self, entry: &StreamEntry) {
        if let Err(e) = self
            .bus
            .ack(&self.group, entry.topic, &entry.stream_id)
            .await
        {
            warn!(
                group = %self.group,
                stream_id = %entry.stream_id,
                error = %e,
                "Ack failed"
            );
        }
    }

    /// One read pass without the loop; test hook mirroring the body of
    /// [`run`](Self::run).
    pub async fn poll_once(&self, dedup: &mut DedupRing) -> BusResult<usize> {
        let entries = self
            .bus
            .read(
                &self.group,
                &self.consumer,
                &self.config.topics,
                self.config.read_count,
                self.config.block_ms,
            )
            .await?;

        let count = entries.len();
        for entry in entries {
            self.handle_entry(dedup, entry).await;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_bus::InMemoryBus;
    use pulse_envelope::EventEnvelope;
    use pulse_push::{Identity, OverflowPolicy, Protocol, PushConfig, PushFrame};
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        bus: Arc<InMemoryBus>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: TenantDispatcher,
    }

    fn fixture(tenant: &str, config: DispatchConfig) -> Fixture {
        fixture_with_push(tenant, config, PushConfig::default())
    }

    fn fixture_with_push(
        tenant: &str,
        config: DispatchConfig,
        push_config: PushConfig,
    ) -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new(push_config, metrics.clone()));
        let dispatcher = TenantDispatcher::new(
            tenant,
            bus.clone() as Arc<dyn StreamBus>,
            registry.clone(),
            Arc::new(SchemaRegistry::with_builtin_schemas()),
            metrics,
            config,
        );
        Fixture {
            bus,
            registry,
            dispatcher,
        }
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            block_ms: 0,
            ..Default::default()
        }
    }

    fn envelope(tenant: &str, event_type: &str) -> EventEnvelope {
        EventEnvelope::new(
            event_type,
            1,
            tenant,
            "agg-1",
            "pulse-worker",
            json!({"items": [], "total_minor_units": 1, "currency": "EUR"}),
        )
    }

    fn connect(fixture: &Fixture, tenant: &str) -> Arc<pulse_push::OutboundQueue> {
        let (_id, queue) = fixture.registry.register(
            &Identity::new(tenant, "u1"),
            Protocol::Sse,
            vec!["*".to_string()],
            HashMap::new(),
        );
        queue
    }

    async fn pop_event_id(queue: &pulse_push::OutboundQueue) -> uuid::Uuid {
        match queue.pop().await.unwrap() {
            PushFrame::Event { envelope, .. } => envelope.event_id,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delivers_tenant_events_and_acks() {
        let fixture = fixture("t1", quick_config());
        let queue = connect(&fixture, "t1");

        fixture
            .bus
            .ensure_group(fixture.dispatcher.group(), &Topic::ALL)
            .await
            .unwrap();
        let env = envelope("t1", "order_created");
        fixture.bus.append(Topic::Orders, &env).await.unwrap();

        let mut dedup = DedupRing::new(16);
        assert_eq!(fixture.dispatcher.poll_once(&mut dedup).await.unwrap(), 1);

        assert_eq!(pop_event_id(&queue).await, env.event_id);
        // Entry was acked.
        assert!(fixture
            .bus
            .pending(fixture.dispatcher.group(), Topic::Orders)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_foreign_tenant_entries_are_filtered_and_acked() {
        let fixture = fixture("t1", quick_config());
        let queue = connect(&fixture, "t1");

        fixture
            .bus
            .ensure_group(fixture.dispatcher.group(), &Topic::ALL)
            .await
            .unwrap();
        fixture
            .bus
            .append(Topic::Orders, &envelope("t2", "order_created"))
            .await
            .unwrap();

        let mut dedup = DedupRing::new(16);
        fixture.dispatcher.poll_once(&mut dedup).await.unwrap();

        assert!(queue.is_empty());
        assert!(fixture
            .bus
            .pending(fixture.dispatcher.group(), Topic::Orders)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_suppressed() {
        let fixture = fixture("t1", quick_config());
        let queue = connect(&fixture, "t1");

        fixture
            .bus
            .ensure_group(fixture.dispatcher.group(), &Topic::ALL)
            .await
            .unwrap();

        // The same envelope appended twice models the reader's
        // crash-window duplicate.
        let env = envelope("t1", "order_created");
        fixture.bus.append(Topic::Orders, &env).await.unwrap();
        fixture.bus.append(Topic::Orders, &env).await.unwrap();

        let mut dedup = DedupRing::new(16);
        fixture.dispatcher.poll_once(&mut dedup).await.unwrap();

        assert_eq!(pop_event_id(&queue).await, env.event_id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_all_connected_policy_leaves_failed_entries_pending() {
        let config = DispatchConfig {
            ack_policy: AckPolicy::AllConnected,
            ..quick_config()
        };
        let push_config = PushConfig {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::Disconnect,
            ..Default::default()
        };
        let fixture = fixture_with_push("t1", config, push_config);
        let _queue = connect(&fixture, "t1");

        fixture
            .bus
            .ensure_group(fixture.dispatcher.group(), &Topic::ALL)
            .await
            .unwrap();
        fixture
            .bus
            .append(Topic::Orders, &envelope("t1", "order_created"))
            .await
            .unwrap();
        fixture
            .bus
            .append(Topic::Orders, &envelope("t1", "order_updated"))
            .await
            .unwrap();

        let mut dedup = DedupRing::new(16);
        fixture.dispatcher.poll_once(&mut dedup).await.unwrap();

        // First entry filled the capacity-1 queue; the second overflowed
        // and must stay pending for redelivery.
        let pending = fixture
            .bus
            .pending(fixture.dispatcher.group(), Topic::Orders)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_idle_shutdown() {
        let config = DispatchConfig {
            idle_shutdown: Duration::from_millis(50),
            block_ms: 10,
            ..Default::default()
        };
        let fixture = fixture("t1", config);

        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fixture.dispatcher.run(rx));

        // No connections ever register: the loop stops on its own.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("dispatcher did not idle out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_shutdown_signal() {
        let config = DispatchConfig {
            block_ms: 10,
            ..Default::default()
        };
        let fixture = fixture("t1", config);
        let _queue = connect(&fixture, "t1");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fixture.dispatcher.run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("dispatcher did not stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_claim_redelivers_through_dedup() {
        let fixture = fixture("t1", quick_config());
        let _queue = connect(&fixture, "t1");

        fixture
            .bus
            .ensure_group(fixture.dispatcher.group(), &Topic::ALL)
            .await
            .unwrap();
        let env = envelope("t1", "order_created");
        fixture.bus.append(Topic::Orders, &env).await.unwrap();

        // A dead consumer read the entry but never acked.
        let abandoned = fixture
            .bus
            .read(
                fixture.dispatcher.group(),
                "dead-consumer",
                &[Topic::Orders],
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);

        // The dispatcher's claim round picks it up and delivers it.
        let mut dedup = DedupRing::new(16);
        let mut config = quick_config();
        config.min_idle = Duration::ZERO;
        // Rebuild with zero min_idle for the claim.
        let dispatcher = TenantDispatcher::new(
            "t1",
            fixture.bus.clone() as Arc<dyn StreamBus>,
            fixture.registry.clone(),
            Arc::new(SchemaRegistry::with_builtin_schemas()),
            Arc::new(Metrics::new()),
            config,
        );
        dispatcher.claim_round(&mut dedup).await;

        assert!(fixture
            .bus
            .pending(fixture.dispatcher.group(), Topic::Orders)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ack_policy_parse() {
        assert_eq!(AckPolicy::parse("best_effort"), Some(AckPolicy::BestEffort));
        assert_eq!(AckPolicy::parse("all_connected"), Some(AckPolicy::AllConnected));
        assert_eq!(AckPolicy::parse("sometimes"), None);
    }
}
