//! Stream bus adapter.
//!
//! Abstracts a log-structured stream with at-least-once delivery: append,
//! consumer-group reads with per-consumer acknowledgements, pending-entry
//! inspection, stale-claim recovery, trimming, and a dead-letter stream
//! per topic.
//!
//! [`RedisStreamBus`] is the production adapter over Redis Streams; it is
//! the only place in the codebase that knows the concrete stream
//! technology. [`InMemoryBus`] is a full-fidelity fake for tests.

pub mod error;
pub mod memory;
pub mod redis;

pub use error::{BusError, BusResult};
pub use memory::InMemoryBus;
pub use redis::RedisStreamBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use pulse_envelope::{EventEnvelope, Topic};

/// Key prefix shared by all pulse streams.
pub const KEY_PREFIX: &str = "pulse";

/// Stream key for a topic: `pulse:stream:{topic}`.
pub fn stream_key(topic: Topic) -> String {
    format!("{KEY_PREFIX}:stream:{topic}")
}

/// Dead-letter key for a topic: `pulse:dlq:{topic}`.
pub fn dlq_key(topic: Topic) -> String {
    format!("{KEY_PREFIX}:dlq:{topic}")
}

/// An entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Bus-assigned monotonic id (`<ms>-<seq>` shape).
    pub stream_id: String,
    pub topic: Topic,
    pub envelope: EventEnvelope,
}

/// Pending-entries information for one unacknowledged entry.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub stream_id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Trim policy for a topic.
#[derive(Debug, Clone)]
pub enum TrimPolicy {
    /// Drop entries with an id strictly below this one.
    MinId(String),
    /// Drop entries older than this age.
    MaxAge(Duration),
}

/// A quarantined event on the dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub envelope: EventEnvelope,
    pub first_failed_at: DateTime<Utc>,
    pub last_error: String,
    pub attempt_count: u32,
    pub origin_stream: String,
    pub origin_id: Option<String>,
}

/// Parse a stream id into its `(ms, seq)` pair.
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

/// Numeric comparison of two stream ids (`true` when `a > b`).
///
/// Lexicographic comparison is wrong for ids of different widths
/// (`"999-0" > "1716-0"` as strings), so replay cursors go through here.
pub fn stream_id_gt(a: &str, b: &str) -> bool {
    match (parse_stream_id(a), parse_stream_id(b)) {
        (Some(a), Some(b)) => a > b,
        _ => a > b,
    }
}

/// Log-structured stream bus with consumer groups.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Round-trip liveness probe.
    async fn ping(&self) -> BusResult<()>;

    /// Create the consumer group on each topic if missing (new-entries
    /// cursor). Safe to call repeatedly.
    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> BusResult<()>;

    /// Append an envelope to a topic, returning the bus-assigned id.
    async fn append(&self, topic: Topic, envelope: &EventEnvelope) -> BusResult<String>;

    /// Read new entries for a consumer in a group, blocking up to
    /// `block_ms` when nothing is available.
    async fn read(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        count: usize,
        block_ms: u64,
    ) -> BusResult<Vec<StreamEntry>>;

    /// Acknowledge an entry for the group.
    async fn ack(&self, group: &str, topic: Topic, stream_id: &str) -> BusResult<()>;

    /// Inspect unacknowledged entries for a group.
    async fn pending(&self, group: &str, topic: Topic) -> BusResult<Vec<PendingInfo>>;

    /// Reclaim entries a dead consumer never acked (idle longer than
    /// `min_idle`), reassigning them to `consumer`.
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        topic: Topic,
        min_idle: Duration,
    ) -> BusResult<Vec<StreamEntry>>;

    /// Non-destructive cursor read (exclusive of `after_id`), oldest
    /// first. Used for replay after reconnect.
    async fn scan(
        &self,
        topic: Topic,
        after_id: Option<&str>,
        count: usize,
    ) -> BusResult<Vec<StreamEntry>>;

    /// Trim a topic. Returns the number of entries removed.
    async fn trim(&self, topic: Topic, policy: TrimPolicy) -> BusResult<u64>;

    /// Append a quarantined event to the topic's dead-letter stream.
    async fn dead_letter(&self, topic: Topic, entry: &DlqEntry) -> BusResult<String>;

    /// Non-destructive read of the dead-letter stream, oldest first.
    async fn dlq_scan(&self, topic: Topic, count: usize) -> BusResult<Vec<(String, DlqEntry)>>;

    /// Remove an entry from the dead-letter stream (operator ack or
    /// successful reprocess).
    async fn dlq_delete(&self, topic: Topic, stream_id: &str) -> BusResult<u64>;

    /// Depth of the dead-letter stream.
    async fn dlq_len(&self, topic: Topic) -> BusResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(stream_key(Topic::Orders), "pulse:stream:orders");
        assert_eq!(dlq_key(Topic::Notifications), "pulse:dlq:notifications");
    }

    #[test]
    fn test_parse_stream_id() {
        assert_eq!(parse_stream_id("1716-0"), Some((1716, 0)));
        assert_eq!(parse_stream_id("1716-12"), Some((1716, 12)));
        assert_eq!(parse_stream_id("bogus"), None);
        assert_eq!(parse_stream_id("1716"), None);
    }

    #[test]
    fn test_stream_id_numeric_comparison() {
        assert!(stream_id_gt("1716-0", "999-0"));
        assert!(stream_id_gt("1716-1", "1716-0"));
        assert!(!stream_id_gt("1716-0", "1716-0"));
        assert!(!stream_id_gt("999-5", "1000-0"));
    }
}
