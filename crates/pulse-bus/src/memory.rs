//! In-memory stream bus for tests.
//!
//! Simulates the semantics the adapters rely on: monotonic ids, consumer
//! groups with a new-entries cursor, a pending-entries list per group,
//! stale-claim reassignment, and trimming. Every other crate tests its
//! worker loops against this implementation.

use crate::error::{BusError, BusResult};
use crate::{
    dlq_key, stream_key, DlqEntry, PendingInfo, StreamBus, StreamEntry, TrimPolicy,
};
use async_trait::async_trait;
use pulse_envelope::{EventEnvelope, Topic};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
struct MemEntry {
    id_num: u64,
    payload: String,
    inserted_at: Instant,
}

impl MemEntry {
    fn id(&self) -> String {
        format!("{}-0", self.id_num)
    }
}

#[derive(Debug, Clone)]
struct MemPending {
    id_num: u64,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct MemGroup {
    last_delivered: u64,
    pel: HashMap<String, MemPending>,
}

#[derive(Debug, Default)]
struct MemStream {
    entries: Vec<MemEntry>,
    next_id: u64,
    groups: HashMap<String, MemGroup>,
}

impl MemStream {
    fn tip(&self) -> u64 {
        self.entries.last().map(|e| e.id_num).unwrap_or(0)
    }

    fn xadd(&mut self, payload: String) -> String {
        self.next_id += 1;
        let entry = MemEntry {
            id_num: self.next_id,
            payload,
            inserted_at: Instant::now(),
        };
        let id = entry.id();
        self.entries.push(entry);
        id
    }
}

/// In-memory [`StreamBus`] implementation.
#[derive(Default)]
pub struct InMemoryBus {
    state: Mutex<HashMap<String, MemStream>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<T>(&self, key: &str, f: impl FnOnce(&mut MemStream) -> T) -> T {
        let mut state = self.state.lock().expect("lock poisoned");
        let stream = state.entry(key.to_string()).or_default();
        f(stream)
    }

    /// Total entries currently on a topic stream (test inspection).
    pub fn stream_len(&self, topic: Topic) -> usize {
        self.with_stream(&stream_key(topic), |s| s.entries.len())
    }

    fn read_once(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        count: usize,
    ) -> Vec<(Topic, String, String)> {
        let mut out = Vec::new();
        for topic in topics {
            if out.len() >= count {
                break;
            }
            let budget = count - out.len();
            let collected = self.with_stream(&stream_key(*topic), |stream| {
                let tip = stream.tip();
                let group_state = stream
                    .groups
                    .entry(group.to_string())
                    .or_insert_with(|| MemGroup {
                        // A group first seen here starts at the tip, the
                        // same cursor ensure_group() establishes.
                        last_delivered: tip,
                        pel: HashMap::new(),
                    });

                let mut collected = Vec::new();
                for entry in &stream.entries {
                    if collected.len() >= budget {
                        break;
                    }
                    if entry.id_num > group_state.last_delivered {
                        group_state.last_delivered = entry.id_num;
                        group_state.pel.insert(
                            entry.id(),
                            MemPending {
                                id_num: entry.id_num,
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                        collected.push((entry.id(), entry.payload.clone()));
                    }
                }
                collected
            });

            for (id, payload) in collected {
                out.push((*topic, id, payload));
            }
        }
        out
    }

    fn decode(&self, group: &str, topic: Topic, id: String, payload: &str) -> Option<StreamEntry> {
        match EventEnvelope::from_json(payload) {
            Ok(envelope) => Some(StreamEntry {
                stream_id: id,
                topic,
                envelope,
            }),
            Err(e) => {
                warn!(stream_id = %id, error = %e, "Dropping undecodable stream entry");
                // Mirror the production adapter: never let an
                // undecodable entry rot in the PEL.
                self.with_stream(&stream_key(topic), |stream| {
                    if let Some(g) = stream.groups.get_mut(group) {
                        g.pel.remove(&id);
                    }
                });
                None
            }
        }
    }
}

#[async_trait]
impl StreamBus for InMemoryBus {
    async fn ping(&self) -> BusResult<()> {
        Ok(())
    }

    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> BusResult<()> {
        for topic in topics {
            self.with_stream(&stream_key(*topic), |stream| {
                let tip = stream.tip();
                stream
                    .groups
                    .entry(group.to_string())
                    .or_insert_with(|| MemGroup {
                        last_delivered: tip,
                        pel: HashMap::new(),
                    });
            });
        }
        Ok(())
    }

    async fn append(&self, topic: Topic, envelope: &EventEnvelope) -> BusResult<String> {
        let json = envelope
            .to_json()
            .map_err(|e| BusError::Protocol(e.to_string()))?;
        Ok(self.with_stream(&stream_key(topic), |stream| stream.xadd(json)))
    }

    async fn read(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        count: usize,
        block_ms: u64,
    ) -> BusResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);

        loop {
            let raw = self.read_once(group, consumer, topics, count);
            if !raw.is_empty() {
                let entries = raw
                    .into_iter()
                    .filter_map(|(topic, id, payload)| self.decode(group, topic, id, &payload))
                    .collect();
                return Ok(entries);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn ack(&self, group: &str, topic: Topic, stream_id: &str) -> BusResult<()> {
        self.with_stream(&stream_key(topic), |stream| {
            if let Some(g) = stream.groups.get_mut(group) {
                g.pel.remove(stream_id);
            }
        });
        Ok(())
    }

    async fn pending(&self, group: &str, topic: Topic) -> BusResult<Vec<PendingInfo>> {
        Ok(self.with_stream(&stream_key(topic), |stream| {
            let Some(g) = stream.groups.get(group) else {
                return Vec::new();
            };
            let mut infos: Vec<PendingInfo> = g
                .pel
                .iter()
                .map(|(id, p)| PendingInfo {
                    stream_id: id.clone(),
                    consumer: p.consumer.clone(),
                    idle: p.delivered_at.elapsed(),
                    delivery_count: p.delivery_count,
                })
                .collect();
            infos.sort_by_key(|p| crate::parse_stream_id(&p.stream_id));
            infos
        }))
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        topic: Topic,
        min_idle: Duration,
    ) -> BusResult<Vec<StreamEntry>> {
        let claimed = self.with_stream(&stream_key(topic), |stream| {
            let Some(g) = stream.groups.get_mut(group) else {
                return Vec::new();
            };

            let mut claimed = Vec::new();
            let mut vanished = Vec::new();
            for (id, pending) in g.pel.iter_mut() {
                if pending.delivered_at.elapsed() < min_idle {
                    continue;
                }
                match stream.entries.iter().find(|e| e.id_num == pending.id_num) {
                    Some(entry) => {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = Instant::now();
                        pending.delivery_count += 1;
                        claimed.push((id.clone(), entry.payload.clone()));
                    }
                    // Trimmed away underneath the PEL.
                    None => vanished.push(id.clone()),
                }
            }
            for id in vanished {
                g.pel.remove(&id);
            }
            claimed.sort_by_key(|(id, _)| crate::parse_stream_id(id));
            claimed
        });

        Ok(claimed
            .into_iter()
            .filter_map(|(id, payload)| self.decode(group, topic, id, &payload))
            .collect())
    }

    async fn scan(
        &self,
        topic: Topic,
        after_id: Option<&str>,
        count: usize,
    ) -> BusResult<Vec<StreamEntry>> {
        let after = after_id
            .and_then(crate::parse_stream_id)
            .map(|(ms, _)| ms)
            .unwrap_or(0);

        let raw = self.with_stream(&stream_key(topic), |stream| {
            stream
                .entries
                .iter()
                .filter(|e| e.id_num > after)
                .take(count)
                .map(|e| (e.id(), e.payload.clone()))
                .collect::<Vec<_>>()
        });

        Ok(raw
            .into_iter()
            .filter_map(|(id, payload)| match EventEnvelope::from_json(&payload) {
                Ok(envelope) => Some(StreamEntry {
                    stream_id: id,
                    topic,
                    envelope,
                }),
                Err(e) => {
                    warn!(stream_id = %id, error = %e, "Skipping undecodable entry during scan");
                    None
                }
            })
            .collect())
    }

    async fn trim(&self, topic: Topic, policy: TrimPolicy) -> BusResult<u64> {
        Ok(self.with_stream(&stream_key(topic), |stream| {
            let before = stream.entries.len();
            match policy {
                TrimPolicy::MinId(id) => {
                    let min = crate::parse_stream_id(&id).map(|(ms, _)| ms).unwrap_or(0);
                    stream.entries.retain(|e| e.id_num >= min);
                }
                TrimPolicy::MaxAge(age) => {
                    stream.entries.retain(|e| e.inserted_at.elapsed() <= age);
                }
            }
            (before - stream.entries.len()) as u64
        }))
    }

    async fn dead_letter(&self, topic: Topic, entry: &DlqEntry) -> BusResult<String> {
        let json = serde_json::to_string(entry)
            .map_err(|e| BusError::Protocol(format!("DLQ entry serialization: {e}")))?;
        Ok(self.with_stream(&dlq_key(topic), |stream| stream.xadd(json)))
    }

    async fn dlq_scan(&self, topic: Topic, count: usize) -> BusResult<Vec<(String, DlqEntry)>> {
        let raw = self.with_stream(&dlq_key(topic), |stream| {
            stream
                .entries
                .iter()
                .take(count)
                .map(|e| (e.id(), e.payload.clone()))
                .collect::<Vec<_>>()
        });

        Ok(raw
            .into_iter()
            .filter_map(|(id, payload)| match serde_json::from_str(&payload) {
                Ok(entry) => Some((id, entry)),
                Err(e) => {
                    warn!(stream_id = %id, error = %e, "Undecodable DLQ entry");
                    None
                }
            })
            .collect())
    }

    async fn dlq_delete(&self, topic: Topic, stream_id: &str) -> BusResult<u64> {
        let Some((num, _)) = crate::parse_stream_id(stream_id) else {
            return Ok(0);
        };
        Ok(self.with_stream(&dlq_key(topic), |stream| {
            let before = stream.entries.len();
            stream.entries.retain(|e| e.id_num != num);
            (before - stream.entries.len()) as u64
        }))
    }

    async fn dlq_len(&self, topic: Topic) -> BusResult<u64> {
        Ok(self.with_stream(&dlq_key(topic), |stream| stream.entries.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn envelope(aggregate: &str) -> EventEnvelope {
        EventEnvelope::new(
            "order_created",
            1,
            "t1",
            aggregate,
            "pulse-api",
            json!({"items": [], "total_minor_units": 1, "currency": "EUR"}),
        )
    }

    #[tokio::test]
    async fn test_append_then_read_roundtrip() {
        let bus = InMemoryBus::new();
        bus.ensure_group("g", &[Topic::Orders]).await.unwrap();

        let env = envelope("o1");
        let id = bus.append(Topic::Orders, &env).await.unwrap();

        let entries = bus.read("g", "c1", &[Topic::Orders], 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_id, id);
        assert_eq!(entries[0].envelope, env);
    }

    #[tokio::test]
    async fn test_group_starts_at_tip() {
        let bus = InMemoryBus::new();
        bus.append(Topic::Orders, &envelope("before")).await.unwrap();

        bus.ensure_group("g", &[Topic::Orders]).await.unwrap();
        bus.append(Topic::Orders, &envelope("after")).await.unwrap();

        let entries = bus.read("g", "c1", &[Topic::Orders], 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.aggregate_id, "after");
    }

    #[tokio::test]
    async fn test_read_is_per_group_and_tracks_pending() {
        let bus = InMemoryBus::new();
        bus.ensure_group("g1", &[Topic::Orders]).await.unwrap();
        bus.ensure_group("g2", &[Topic::Orders]).await.unwrap();
        bus.append(Topic::Orders, &envelope("o1")).await.unwrap();

        let from_g1 = bus.read("g1", "c", &[Topic::Orders], 10, 0).await.unwrap();
        let from_g2 = bus.read("g2", "c", &[Topic::Orders], 10, 0).await.unwrap();
        assert_eq!(from_g1.len(), 1);
        assert_eq!(from_g2.len(), 1);

        // Unacked entries sit in each group's PEL independently.
        assert_eq!(bus.pending("g1", Topic::Orders).await.unwrap().len(), 1);
        bus.ack("g1", Topic::Orders, &from_g1[0].stream_id)
            .await
            .unwrap();
        assert!(bus.pending("g1", Topic::Orders).await.unwrap().is_empty());
        assert_eq!(bus.pending("g2", Topic::Orders).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_does_not_redeliver_without_claim() {
        let bus = InMemoryBus::new();
        bus.ensure_group("g", &[Topic::Orders]).await.unwrap();
        bus.append(Topic::Orders, &envelope("o1")).await.unwrap();

        let first = bus.read("g", "c", &[Topic::Orders], 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = bus.read("g", "c", &[Topic::Orders], 10, 0).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_claim_stale_reassigns_unacked() {
        let bus = InMemoryBus::new();
        bus.ensure_group("g", &[Topic::Orders]).await.unwrap();
        bus.append(Topic::Orders, &envelope("o1")).await.unwrap();

        let read = bus.read("g", "dead", &[Topic::Orders], 10, 0).await.unwrap();
        assert_eq!(read.len(), 1);

        // Nothing is stale yet.
        let claimed = bus
            .claim_stale("g", "alive", Topic::Orders, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // With a zero idle threshold everything pending is claimable.
        let claimed = bus
            .claim_stale("g", "alive", Topic::Orders, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = bus.pending("g", Topic::Orders).await.unwrap();
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_scan_after_cursor() {
        let bus = InMemoryBus::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                bus.append(Topic::Orders, &envelope(&format!("o{i}")))
                    .await
                    .unwrap(),
            );
        }

        let all = bus.scan(Topic::Orders, None, 100).await.unwrap();
        assert_eq!(all.len(), 4);

        let tail = bus.scan(Topic::Orders, Some(&ids[1]), 100).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].stream_id, ids[2]);
        assert_eq!(tail[1].stream_id, ids[3]);
    }

    #[tokio::test]
    async fn test_trim_min_id() {
        let bus = InMemoryBus::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                bus.append(Topic::Orders, &envelope(&format!("o{i}")))
                    .await
                    .unwrap(),
            );
        }

        let trimmed = bus
            .trim(Topic::Orders, TrimPolicy::MinId(ids[2].clone()))
            .await
            .unwrap();
        assert_eq!(trimmed, 2);
        assert_eq!(bus.stream_len(Topic::Orders), 1);
    }

    #[tokio::test]
    async fn test_dlq_lifecycle() {
        let bus = InMemoryBus::new();
        let entry = DlqEntry {
            envelope: envelope("o1"),
            first_failed_at: Utc::now(),
            last_error: "schema mismatch".to_string(),
            attempt_count: 8,
            origin_stream: "pulse:stream:orders".to_string(),
            origin_id: None,
        };

        let id = bus.dead_letter(Topic::Orders, &entry).await.unwrap();
        assert_eq!(bus.dlq_len(Topic::Orders).await.unwrap(), 1);

        let scanned = bus.dlq_scan(Topic::Orders, 10).await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, id);
        assert_eq!(scanned[0].1.attempt_count, 8);

        assert_eq!(bus.dlq_delete(Topic::Orders, &id).await.unwrap(), 1);
        assert_eq!(bus.dlq_len(Topic::Orders).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_respects_count_across_topics() {
        let bus = InMemoryBus::new();
        bus.ensure_group("g", &[Topic::Orders, Topic::Notifications])
            .await
            .unwrap();

        for i in 0..3 {
            bus.append(Topic::Orders, &envelope(&format!("o{i}")))
                .await
                .unwrap();
        }

        let entries = bus
            .read("g", "c", &[Topic::Orders, Topic::Notifications], 2, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }
}
