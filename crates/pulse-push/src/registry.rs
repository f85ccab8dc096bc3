//! Connection registry.
//!
//! In-memory directory of live push connections, sharded by `tenant_id`
//! hash so dispatch for one tenant never contends with another. Records
//! are exclusively owned by the registry; the dispatcher and the
//! endpoints address them by `connection_id` only.

use crate::auth::Identity;
use crate::error::{PushError, PushResult};
use crate::frames::{glob_match, Channel, PushFrame};
use crate::queue::{CloseReason, OutboundQueue, OverflowPolicy, PushOutcome};
use chrono::{DateTime, Utc};
use pulse_bus::{stream_id_gt, StreamEntry};
use pulse_envelope::Topic;
use pulse_metrics::Metrics;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Push layer configuration.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// What to do when a connection's queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Heartbeat interval per channel.
    pub heartbeat_general: Duration,
    pub heartbeat_orders: Duration,
    pub heartbeat_notifications: Duration,
    /// Registry shard count.
    pub shard_count: usize,
    /// Entries fetched per replay scan.
    pub replay_chunk: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::Disconnect,
            heartbeat_general: Duration::from_secs(30),
            heartbeat_orders: Duration::from_secs(45),
            heartbeat_notifications: Duration::from_secs(60),
            shard_count: 16,
            replay_chunk: 500,
        }
    }
}

impl PushConfig {
    pub fn heartbeat_for(&self, channel: Channel) -> Duration {
        match channel {
            Channel::General => self.heartbeat_general,
            Channel::Orders => self.heartbeat_orders,
            Channel::Notifications => self.heartbeat_notifications,
        }
    }
}

/// Push protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Sse,
    WebSocket,
}

struct ConnectionRecord {
    tenant_id: String,
    user_id: String,
    protocol: Protocol,
    subscriptions: HashSet<String>,
    last_event_ids: HashMap<Topic, String>,
    last_activity_at: DateTime<Utc>,
    credential_expires_at: Option<DateTime<Utc>>,
    queue: Arc<OutboundQueue>,
}

impl ConnectionRecord {
    /// An empty filter set means the connection takes everything for
    /// its tenant (a client that unsubscribed from its last filter
    /// keeps receiving events rather than going silently deaf).
    fn matches(&self, event_type: &str) -> bool {
        if self.subscriptions.is_empty() {
            return true;
        }
        self.subscriptions
            .iter()
            .any(|filter| glob_match(filter, event_type))
    }
}

/// Result of fanning one entry out to a tenant's connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Connections whose filters matched.
    pub matched: usize,
    /// Frames enqueued.
    pub delivered: usize,
    /// Enqueues that failed (overflow or closed queue).
    pub failed: usize,
}

/// Registry stats for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub sse_connections: usize,
    pub websocket_connections: usize,
    pub connections_by_tenant: HashMap<String, usize>,
}

/// Sharded directory of live push connections.
pub struct ConnectionRegistry {
    shards: Vec<RwLock<HashMap<Uuid, ConnectionRecord>>>,
    tenants: Mutex<HashMap<Uuid, String>>,
    config: PushConfig,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(config: PushConfig, metrics: Arc<Metrics>) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            tenants: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    fn shard(&self, tenant_id: &str) -> &RwLock<HashMap<Uuid, ConnectionRecord>> {
        let mut hasher = DefaultHasher::new();
        tenant_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn shard_of(&self, connection_id: Uuid) -> Option<&RwLock<HashMap<Uuid, ConnectionRecord>>> {
        let tenants = self.tenants.lock().expect("lock poisoned");
        tenants.get(&connection_id).map(|tenant| self.shard(tenant))
    }

    /// Create a record for a validated connection. Returns the id and
    /// the outbound queue its writer task drains.
    pub fn register(
        &self,
        identity: &Identity,
        protocol: Protocol,
        filters: Vec<String>,
        initial_cursors: HashMap<Topic, String>,
    ) -> (Uuid, Arc<OutboundQueue>) {
        let connection_id = Uuid::new_v4();
        let queue = Arc::new(OutboundQueue::new(self.config.queue_capacity));

        let record = ConnectionRecord {
            tenant_id: identity.tenant_id.clone(),
            user_id: identity.user_id.clone(),
            protocol,
            subscriptions: filters.into_iter().collect(),
            last_event_ids: initial_cursors,
            last_activity_at: Utc::now(),
            credential_expires_at: identity.expires_at,
            queue: queue.clone(),
        };

        self.shard(&identity.tenant_id)
            .write()
            .expect("lock poisoned")
            .insert(connection_id, record);
        self.tenants
            .lock()
            .expect("lock poisoned")
            .insert(connection_id, identity.tenant_id.clone());
        self.metrics.connections_open.inc();

        info!(
            connection_id = %connection_id,
            tenant_id = %identity.tenant_id,
            user_id = %identity.user_id,
            protocol = ?protocol,
            "Connection registered"
        );

        (connection_id, queue)
    }

    /// Remove a connection and close its queue with `reason`.
    pub fn remove(&self, connection_id: Uuid, reason: CloseReason) -> bool {
        let tenant = self
            .tenants
            .lock()
            .expect("lock poisoned")
            .remove(&connection_id);
        let Some(tenant) = tenant else {
            return false;
        };

        let removed = self
            .shard(&tenant)
            .write()
            .expect("lock poisoned")
            .remove(&connection_id);

        if let Some(record) = removed {
            record.queue.close(reason);
            self.metrics.connections_open.dec();
            info!(
                connection_id = %connection_id,
                tenant_id = %tenant,
                reason = ?reason,
                "Connection removed"
            );
            true
        } else {
            false
        }
    }

    /// Add subscription filters to a connection.
    pub fn subscribe(&self, connection_id: Uuid, filters: &[String]) -> PushResult<()> {
        self.with_record_mut(connection_id, |record| {
            for filter in filters {
                record.subscriptions.insert(filter.clone());
            }
            record.last_activity_at = Utc::now();
        })
    }

    /// Drop subscription filters from a connection.
    pub fn unsubscribe(&self, connection_id: Uuid, filters: &[String]) -> PushResult<()> {
        self.with_record_mut(connection_id, |record| {
            for filter in filters {
                record.subscriptions.remove(filter);
            }
            record.last_activity_at = Utc::now();
        })
    }

    /// Record the latest delivered stream id for a topic.
    pub fn set_cursor(&self, connection_id: Uuid, topic: Topic, stream_id: &str) -> PushResult<()> {
        self.with_record_mut(connection_id, |record| {
            record.last_event_ids.insert(topic, stream_id.to_string());
        })
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.tenants
            .lock()
            .expect("lock poisoned")
            .contains_key(&connection_id)
    }

    /// Whether the connection's credential has expired. `None` when the
    /// connection is gone.
    pub fn credential_expired(&self, connection_id: Uuid, now: DateTime<Utc>) -> Option<bool> {
        let shard = self.shard_of(connection_id)?;
        let guard = shard.read().expect("lock poisoned");
        guard
            .get(&connection_id)
            .map(|record| record.credential_expires_at.map(|at| now >= at).unwrap_or(false))
    }

    /// Build the stats control frame for a connection.
    pub fn stats_frame(&self, connection_id: Uuid) -> PushResult<PushFrame> {
        let shard = self
            .shard_of(connection_id)
            .ok_or(PushError::UnknownConnection(connection_id))?;
        let guard = shard.read().expect("lock poisoned");
        let record = guard
            .get(&connection_id)
            .ok_or(PushError::UnknownConnection(connection_id))?;

        let mut subscriptions: Vec<_> = record.subscriptions.iter().cloned().collect();
        subscriptions.sort();

        Ok(PushFrame::Stats {
            connection_id,
            tenant_id: record.tenant_id.clone(),
            subscriptions,
            queue_depth: record.queue.len(),
        })
    }

    /// Iterate live connections for a tenant whose filters match
    /// `event_type`.
    pub fn for_each(
        &self,
        tenant_id: &str,
        event_type: &str,
        mut f: impl FnMut(Uuid, &Arc<OutboundQueue>),
    ) {
        let guard = self.shard(tenant_id).read().expect("lock poisoned");
        for (id, record) in guard.iter() {
            if record.tenant_id == tenant_id && record.matches(event_type) {
                f(*id, &record.queue);
            }
        }
    }

    /// Fan one stream entry out to every matching connection of its
    /// tenant. Applies the configured overflow policy; connections that
    /// overflow under `disconnect` are closed with code 4001.
    pub async fn dispatch(&self, entry: &StreamEntry) -> DispatchOutcome {
        let tenant_id = entry.envelope.tenant_id.clone();
        let event_type = entry.envelope.event_type.clone();

        // Collect targets under the read lock, enqueue outside it (the
        // block policy awaits queue capacity).
        let targets: Vec<(Uuid, Arc<OutboundQueue>)> = {
            let guard = self.shard(&tenant_id).read().expect("lock poisoned");
            guard
                .iter()
                .filter(|(_, record)| {
                    record.tenant_id == tenant_id
                        && record.matches(&event_type)
                        && !already_delivered(record, entry)
                })
                .map(|(id, record)| (*id, record.queue.clone()))
                .collect()
        };

        let mut outcome = DispatchOutcome {
            matched: targets.len(),
            ..Default::default()
        };
        let mut delivered_ids = Vec::new();
        let mut overflowed = Vec::new();

        for (connection_id, queue) in targets {
            let frame = PushFrame::Event {
                topic: entry.topic,
                stream_id: Some(entry.stream_id.clone()),
                envelope: entry.envelope.clone(),
            };

            match queue.push(frame, self.config.overflow_policy).await {
                Ok(PushOutcome::Enqueued) | Ok(PushOutcome::DroppedOldest) => {
                    outcome.delivered += 1;
                    delivered_ids.push(connection_id);
                    self.metrics.push_messages_sent_total.inc();
                    self.metrics.push_queue_depth.observe(queue.len() as f64);
                }
                Ok(PushOutcome::Overflow) => {
                    outcome.failed += 1;
                    overflowed.push(connection_id);
                    self.metrics.push_send_failures_total.inc();
                }
                Err(_closed) => {
                    outcome.failed += 1;
                    self.metrics.push_send_failures_total.inc();
                }
            }
        }

        if !delivered_ids.is_empty() {
            let mut guard = self.shard(&tenant_id).write().expect("lock poisoned");
            for connection_id in delivered_ids {
                if let Some(record) = guard.get_mut(&connection_id) {
                    record
                        .last_event_ids
                        .insert(entry.topic, entry.stream_id.clone());
                    record.last_activity_at = Utc::now();
                }
            }
        }

        for connection_id in overflowed {
            warn!(
                connection_id = %connection_id,
                tenant_id = %tenant_id,
                "Outbound queue overflow, disconnecting"
            );
            self.remove(connection_id, CloseReason::Overflow);
        }

        debug!(
            tenant_id = %tenant_id,
            event_type = %event_type,
            matched = outcome.matched,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Dispatched entry"
        );

        outcome
    }

    /// Deliver one entry to one connection (replay path). Returns
    /// whether a frame was enqueued; skips entries at or before the
    /// connection's cursor and entries that do not match its tenant or
    /// filters.
    pub async fn deliver_entry(
        &self,
        connection_id: Uuid,
        entry: &StreamEntry,
    ) -> PushResult<bool> {
        let queue = {
            let shard = self
                .shard_of(connection_id)
                .ok_or(PushError::UnknownConnection(connection_id))?;
            let guard = shard.read().expect("lock poisoned");
            let record = guard
                .get(&connection_id)
                .ok_or(PushError::UnknownConnection(connection_id))?;

            if record.tenant_id != entry.envelope.tenant_id
                || !record.matches(&entry.envelope.event_type)
                || already_delivered(record, entry)
            {
                return Ok(false);
            }
            record.queue.clone()
        };

        let frame = PushFrame::Event {
            topic: entry.topic,
            stream_id: Some(entry.stream_id.clone()),
            envelope: entry.envelope.clone(),
        };

        match queue.push(frame, self.config.overflow_policy).await {
            Ok(PushOutcome::Enqueued) | Ok(PushOutcome::DroppedOldest) => {
                self.metrics.push_messages_sent_total.inc();
                self.set_cursor(connection_id, entry.topic, &entry.stream_id)?;
                Ok(true)
            }
            Ok(PushOutcome::Overflow) => {
                self.metrics.push_send_failures_total.inc();
                self.remove(connection_id, CloseReason::Overflow);
                Err(PushError::UnknownConnection(connection_id))
            }
            Err(_closed) => Err(PushError::UnknownConnection(connection_id)),
        }
    }

    /// Live connections for a tenant.
    pub fn tenant_connection_count(&self, tenant_id: &str) -> usize {
        let guard = self.shard(tenant_id).read().expect("lock poisoned");
        guard
            .values()
            .filter(|record| record.tenant_id == tenant_id)
            .count()
    }

    pub fn total_connections(&self) -> usize {
        self.tenants.lock().expect("lock poisoned").len()
    }

    /// Close every connection of a tenant with the eviction code.
    pub fn evict_tenant(&self, tenant_id: &str) -> usize {
        let ids: Vec<Uuid> = {
            let guard = self.shard(tenant_id).read().expect("lock poisoned");
            guard
                .iter()
                .filter(|(_, record)| record.tenant_id == tenant_id)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut evicted = 0;
        for id in ids {
            if self.remove(id, CloseReason::Evicted) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Registry stats for the admin surface.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_connections: 0,
            sse_connections: 0,
            websocket_connections: 0,
            connections_by_tenant: HashMap::new(),
        };

        for shard in &self.shards {
            let guard = shard.read().expect("lock poisoned");
            for record in guard.values() {
                stats.total_connections += 1;
                match record.protocol {
                    Protocol::Sse => stats.sse_connections += 1,
                    Protocol::WebSocket => stats.websocket_connections += 1,
                }
                *stats
                    .connections_by_tenant
                    .entry(record.tenant_id.clone())
                    .or_insert(0) += 1;
            }
        }

        stats
    }

    fn with_record_mut(
        &self,
        connection_id: Uuid,
        f: impl FnOnce(&mut ConnectionRecord),
    ) -> PushResult<()> {
        let shard = self
            .shard_of(connection_id)
            .ok_or(PushError::UnknownConnection(connection_id))?;
        let mut guard = shard.write().expect("lock poisoned");
        let record = guard
            .get_mut(&connection_id)
            .ok_or(PushError::UnknownConnection(connection_id))?;
        f(record);
        Ok(())
    }
}

/// An entry at or before the connection's cursor for its topic has
/// already been delivered (live dispatch and replay overlap under
/// at-least-once redelivery).
fn already_delivered(record: &ConnectionRecord, entry: &StreamEntry) -> bool {
    match record.last_event_ids.get(&entry.topic) {
        Some(cursor) => !stream_id_gt(&entry.stream_id, cursor),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_envelope::EventEnvelope;
    use serde_json::json;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(PushConfig::default(), Arc::new(Metrics::new()))
    }

    fn registry_with(config: PushConfig) -> ConnectionRegistry {
        ConnectionRegistry::new(config, Arc::new(Metrics::new()))
    }

    fn entry(tenant: &str, event_type: &str, stream_id: &str) -> StreamEntry {
        StreamEntry {
            stream_id: stream_id.to_string(),
            topic: Topic::for_event_type(event_type),
            envelope: EventEnvelope::new(
                event_type,
                1,
                tenant,
                "agg-1",
                "pulse-worker",
                json!({"total_minor_units": 1}),
            ),
        }
    }

    fn register(registry: &ConnectionRegistry, tenant: &str, filters: &[&str]) -> (Uuid, Arc<OutboundQueue>) {
        registry.register(
            &Identity::new(tenant, "u1"),
            Protocol::Sse,
            filters.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_reaches_matching_tenant_connections() {
        let registry = registry();
        let (_id, queue) = register(&registry, "t1", &["order_*"]);

        let outcome = registry.dispatch(&entry("t1", "order_created", "1-0")).await;
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_is_tenant_isolated() {
        let registry = registry();
        let (_a, queue_t1) = register(&registry, "t1", &["*"]);
        let (_b, queue_t2) = register(&registry, "t2", &["*"]);

        let outcome = registry.dispatch(&entry("t2", "order_created", "1-0")).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(queue_t2.len(), 1);
        assert!(queue_t1.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_honors_subscription_filters() {
        let registry = registry();
        let (_a, orders_queue) = register(&registry, "t1", &["order_*"]);
        let (_b, notif_queue) = register(&registry, "t1", &["notification_*"]);

        registry.dispatch(&entry("t1", "order_created", "1-0")).await;
        assert_eq!(orders_queue.len(), 1);
        assert!(notif_queue.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_skips_already_delivered() {
        let registry = registry();
        let (id, queue) = register(&registry, "t1", &["*"]);

        registry.dispatch(&entry("t1", "order_created", "5-0")).await;
        assert_eq!(queue.len(), 1);

        // Replay overlap: an older or equal id is suppressed.
        let outcome = registry.dispatch(&entry("t1", "order_created", "5-0")).await;
        assert_eq!(outcome.matched, 0);
        let outcome = registry.dispatch(&entry("t1", "order_created", "4-0")).await;
        assert_eq!(outcome.matched, 0);
        assert_eq!(queue.len(), 1);

        // Newer ids still flow.
        registry.dispatch(&entry("t1", "order_created", "6-0")).await;
        assert_eq!(queue.len(), 2);
        assert!(registry.contains(id));
    }

    #[tokio::test]
    async fn test_overflow_disconnects_with_eviction_close() {
        let config = PushConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::Disconnect,
            ..Default::default()
        };
        let registry = registry_with(config);
        let (id, queue) = register(&registry, "t1", &["*"]);

        for n in 0..2 {
            registry
                .dispatch(&entry("t1", "order_created", &format!("{}-0", n + 1)))
                .await;
        }
        let outcome = registry.dispatch(&entry("t1", "order_created", "9-0")).await;
        assert_eq!(outcome.failed, 1);

        // Connection is gone and its queue closed with the eviction code.
        assert!(!registry.contains(id));
        // Drain the two delivered frames, then observe the close reason.
        queue.pop().await.unwrap();
        queue.pop().await.unwrap();
        assert_eq!(queue.pop().await.unwrap_err(), CloseReason::Overflow);
        assert_eq!(CloseReason::Overflow.close_code(), 4001);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_connection() {
        let config = PushConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropOldest,
            ..Default::default()
        };
        let registry = registry_with(config);
        let (id, queue) = register(&registry, "t1", &["*"]);

        for n in 1..=3 {
            registry
                .dispatch(&entry("t1", "order_created", &format!("{n}-0")))
                .await;
        }

        assert!(registry.contains(id));
        assert_eq!(queue.len(), 2);
        // Oldest frame was dropped; latest wins.
        match queue.pop().await.unwrap() {
            PushFrame::Event { stream_id, .. } => assert_eq!(stream_id.as_deref(), Some("2-0")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let registry = registry();
        let (id, queue) = register(&registry, "t1", &["order_*"]);

        registry.dispatch(&entry("t1", "notification_sent", "1-0")).await;
        assert!(queue.is_empty());

        registry
            .subscribe(id, &["notification_*".to_string()])
            .unwrap();
        registry.dispatch(&entry("t1", "notification_sent", "2-0")).await;
        assert_eq!(queue.len(), 1);

        registry
            .unsubscribe(id, &["notification_*".to_string()])
            .unwrap();
        registry.dispatch(&entry("t1", "notification_sent", "3-0")).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_filter_set_matches_all_tenant_events() {
        let registry = registry();
        let (id, queue) = register(&registry, "t1", &["order_*"]);

        // Dropping the last filter leaves the set empty: the connection
        // now takes every event for its tenant.
        registry.unsubscribe(id, &["order_*".to_string()]).unwrap();

        registry.dispatch(&entry("t1", "order_created", "1-0")).await;
        registry
            .dispatch(&entry("t1", "notification_sent", "2-0"))
            .await;
        assert_eq!(queue.len(), 2);

        // Tenant isolation still holds with no filters.
        let outcome = registry.dispatch(&entry("t2", "order_created", "3-0")).await;
        assert_eq!(outcome.matched, 0);
        assert_eq!(queue.len(), 2);

        // The replay path honors the same rule.
        assert!(registry
            .deliver_entry(id, &entry("t1", "order_updated", "4-0"))
            .await
            .unwrap());
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_deliver_entry_replay_path() {
        let registry = registry();
        let (id, queue) = register(&registry, "t1", &["order_*"]);

        // Matching entry delivers and advances the cursor.
        assert!(registry
            .deliver_entry(id, &entry("t1", "order_created", "3-0"))
            .await
            .unwrap());
        assert_eq!(queue.len(), 1);

        // Same entry again is a no-op.
        assert!(!registry
            .deliver_entry(id, &entry("t1", "order_created", "3-0"))
            .await
            .unwrap());

        // Foreign tenant or unmatched filter is a no-op.
        assert!(!registry
            .deliver_entry(id, &entry("t2", "order_created", "4-0"))
            .await
            .unwrap());
        assert!(!registry
            .deliver_entry(id, &entry("t1", "notification_sent", "5-0"))
            .await
            .unwrap());

        assert!(matches!(
            registry
                .deliver_entry(Uuid::new_v4(), &entry("t1", "order_created", "6-0"))
                .await,
            Err(PushError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_and_counts() {
        let registry = registry();
        let (a, _qa) = register(&registry, "t1", &["*"]);
        let (_b, _qb) = register(&registry, "t1", &["*"]);
        let (_c, _qc) = register(&registry, "t2", &["*"]);

        assert_eq!(registry.tenant_connection_count("t1"), 2);
        assert_eq!(registry.total_connections(), 3);

        assert!(registry.remove(a, CloseReason::Normal));
        assert!(!registry.remove(a, CloseReason::Normal));
        assert_eq!(registry.tenant_connection_count("t1"), 1);
        assert_eq!(registry.total_connections(), 2);
    }

    #[tokio::test]
    async fn test_evict_tenant_closes_all() {
        let registry = registry();
        let (_a, qa) = register(&registry, "t1", &["*"]);
        let (_b, _qb) = register(&registry, "t2", &["*"]);

        assert_eq!(registry.evict_tenant("t1"), 1);
        assert_eq!(registry.tenant_connection_count("t1"), 0);
        assert_eq!(registry.tenant_connection_count("t2"), 1);
        assert_eq!(qa.pop().await.unwrap_err(), CloseReason::Evicted);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = registry();
        register(&registry, "t1", &["*"]);
        register(&registry, "t1", &["*"]);
        registry.register(
            &Identity::new("t2", "u2"),
            Protocol::WebSocket,
            vec!["*".to_string()],
            HashMap::new(),
        );

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.sse_connections, 2);
        assert_eq!(stats.websocket_connections, 1);
        assert_eq!(stats.connections_by_tenant["t1"], 2);
        assert_eq!(stats.connections_by_tenant["t2"], 1);
    }

    #[tokio::test]
    async fn test_credential_expiry_lookup() {
        let registry = registry();
        let mut identity = Identity::new("t1", "u1");
        identity.expires_at = Some(Utc::now() + chrono::Duration::minutes(5));
        let (id, _queue) = registry.register(&identity, Protocol::Sse, vec![], HashMap::new());

        assert_eq!(registry.credential_expired(id, Utc::now()), Some(false));
        assert_eq!(
            registry.credential_expired(id, Utc::now() + chrono::Duration::minutes(6)),
            Some(true)
        );
        assert_eq!(registry.credential_expired(Uuid::new_v4(), Utc::now()), None);
    }

    #[tokio::test]
    async fn test_initial_cursor_suppresses_old_entries() {
        let registry = registry();
        let mut cursors = HashMap::new();
        cursors.insert(Topic::Orders, "10-0".to_string());
        let (_id, queue) = registry.register(
            &Identity::new("t1", "u1"),
            Protocol::Sse,
            vec!["*".to_string()],
            cursors,
        );

        registry.dispatch(&entry("t1", "order_created", "9-0")).await;
        assert!(queue.is_empty());
        registry.dispatch(&entry("t1", "order_created", "11-0")).await;
        assert_eq!(queue.len(), 1);
    }
}
