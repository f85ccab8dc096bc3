//! Redis Streams adapter.
//!
//! Issues raw stream commands (`XADD`, `XREADGROUP`, `XACK`, `XPENDING`,
//! `XAUTOCLAIM`, `XRANGE`, `XTRIM`, `XDEL`) over a multiplexed async
//! connection and walks the nested reply values by hand. Every command is
//! bounded by the configured operation timeout.

use crate::error::{BusError, BusResult};
use crate::{
    dlq_key, stream_key, DlqEntry, PendingInfo, StreamBus, StreamEntry, TrimPolicy,
};
use async_trait::async_trait;
use chrono::Utc;
use pulse_envelope::{EventEnvelope, Topic};
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Field name carrying the serialized envelope on stream entries.
const ENVELOPE_FIELD: &str = "envelope";

/// Field name carrying the serialized DLQ entry on dead-letter streams.
const DLQ_FIELD: &str = "entry";

/// Redis Streams implementation of [`StreamBus`].
pub struct RedisStreamBus {
    client: Client,
    conn: RwLock<MultiplexedConnection>,
    op_timeout: Duration,
}

impl RedisStreamBus {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> BusResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(url = %redis_url, "Connected to Redis stream bus");

        Ok(Self {
            client,
            conn: RwLock::new(conn),
            op_timeout,
        })
    }

    /// Re-establish the multiplexed connection after an error.
    pub async fn reconnect(&self) -> BusResult<()> {
        info!("Reconnecting to Redis...");
        let fresh = self.client.get_multiplexed_async_connection().await?;
        *self.conn.write().await = fresh;
        Ok(())
    }

    async fn connection(&self) -> MultiplexedConnection {
        self.conn.read().await.clone()
    }

    /// Run a command with the operation deadline. `extra` stretches the
    /// deadline for server-side blocking reads.
    async fn run<T: redis::FromRedisValue>(
        &self,
        op: &'static str,
        cmd: Cmd,
        extra: Duration,
    ) -> BusResult<T> {
        let mut conn = self.connection().await;
        let deadline = self.op_timeout + extra;
        let query = cmd.query_async(&mut conn);
        match tokio::time::timeout(deadline, query).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BusError::Timeout(op)),
        }
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Extract `(id, field_map)` pairs from an XRANGE-shaped message array.
fn parse_messages(value: &Value) -> BusResult<Vec<(String, Vec<(String, String)>)>> {
    let messages = match value {
        Value::Array(messages) => messages,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(BusError::Protocol(format!(
                "expected message array, got {other:?}"
            )))
        }
    };

    let mut parsed = Vec::with_capacity(messages.len());
    for message in messages {
        let parts = match message {
            Value::Array(parts) if parts.len() >= 2 => parts,
            other => {
                return Err(BusError::Protocol(format!(
                    "malformed stream message: {other:?}"
                )))
            }
        };

        let id = as_string(&parts[0])
            .ok_or_else(|| BusError::Protocol("message id is not a string".to_string()))?;

        let raw_fields = match &parts[1] {
            Value::Array(fields) => fields,
            other => {
                return Err(BusError::Protocol(format!(
                    "message fields are not an array: {other:?}"
                )))
            }
        };

        let mut fields = Vec::new();
        let mut i = 0;
        while i + 1 < raw_fields.len() {
            if let (Some(name), Some(value)) =
                (as_string(&raw_fields[i]), as_string(&raw_fields[i + 1]))
            {
                fields.push((name, value));
            }
            i += 2;
        }

        parsed.push((id, fields));
    }

    Ok(parsed)
}

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn entry_from_fields(
    topic: Topic,
    id: String,
    fields: &[(String, String)],
) -> BusResult<StreamEntry> {
    let raw = field(fields, ENVELOPE_FIELD).ok_or_else(|| {
        BusError::Protocol(format!("entry {id} is missing the {ENVELOPE_FIELD} field"))
    })?;

    let envelope = EventEnvelope::from_json(raw).map_err(|e| match e {
        pulse_envelope::EnvelopeError::Serialization(source) => BusError::Entry {
            stream_id: id.clone(),
            source,
        },
        other => BusError::Protocol(other.to_string()),
    })?;

    Ok(StreamEntry {
        stream_id: id,
        topic,
        envelope,
    })
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    async fn ping(&self) -> BusResult<()> {
        let mut cmd = redis::cmd("PING");
        cmd.arg("pulse");
        let _: String = self.run("PING", cmd, Duration::ZERO).await?;
        Ok(())
    }

    async fn ensure_group(&self, group: &str, topics: &[Topic]) -> BusResult<()> {
        for topic in topics {
            let key = stream_key(*topic);

            // $ starts the group at the stream tip; replay for late
            // joiners goes through scan() with a client cursor instead.
            let mut cmd = redis::cmd("XGROUP");
            cmd.arg("CREATE").arg(&key).arg(group).arg("$").arg("MKSTREAM");

            match self.run::<()>("XGROUP CREATE", cmd, Duration::ZERO).await {
                Ok(()) => {
                    info!(stream = %key, group = %group, "Created consumer group");
                }
                Err(BusError::Redis(e)) if e.to_string().contains("BUSYGROUP") => {
                    debug!(stream = %key, group = %group, "Consumer group already exists");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn append(&self, topic: Topic, envelope: &EventEnvelope) -> BusResult<String> {
        let json = envelope
            .to_json()
            .map_err(|e| BusError::Protocol(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key(topic)).arg("*").arg(ENVELOPE_FIELD).arg(&json);
        let stream_id: String = self.run("XADD", cmd, Duration::ZERO).await?;

        debug!(
            topic = %topic,
            event_id = %envelope.event_id,
            stream_id = %stream_id,
            "Appended envelope"
        );

        Ok(stream_id)
    }

    async fn read(
        &self,
        group: &str,
        consumer: &str,
        topics: &[Topic],
        count: usize,
        block_ms: u64,
    ) -> BusResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS");
        for topic in topics {
            cmd.arg(stream_key(*topic));
        }
        for _ in topics {
            cmd.arg(">");
        }

        let reply: Value = self
            .run("XREADGROUP", cmd, Duration::from_millis(block_ms))
            .await?;

        let streams = match reply {
            Value::Nil => return Ok(Vec::new()),
            Value::Array(streams) => streams,
            other => {
                return Err(BusError::Protocol(format!(
                    "unexpected XREADGROUP reply: {other:?}"
                )))
            }
        };

        let mut entries = Vec::new();
        for stream in &streams {
            let parts = match stream {
                Value::Array(parts) if parts.len() >= 2 => parts,
                other => {
                    return Err(BusError::Protocol(format!(
                        "malformed stream block: {other:?}"
                    )))
                }
            };

            let key = as_string(&parts[0])
                .ok_or_else(|| BusError::Protocol("stream key is not a string".to_string()))?;
            let topic = key
                .strip_prefix(&format!("{}:stream:", crate::KEY_PREFIX))
                .and_then(Topic::parse)
                .ok_or_else(|| BusError::Protocol(format!("unknown stream key {key}")))?;

            for (id, fields) in parse_messages(&parts[1])? {
                match entry_from_fields(topic, id, &fields) {
                    Ok(entry) => entries.push(entry),
                    Err(BusError::Entry { stream_id, source }) => {
                        // A payload that does not decode can never be
                        // delivered; ack it out of the PEL instead of
                        // letting stale-claim recycle it forever.
                        warn!(
                            stream_id = %stream_id,
                            error = %source,
                            "Dropping undecodable stream entry"
                        );
                        self.ack(group, topic, &stream_id).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(entries)
    }

    async fn ack(&self, group: &str, topic: Topic, stream_id: &str) -> BusResult<()> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream_key(topic)).arg(group).arg(stream_id);
        let acked: i64 = self.run("XACK", cmd, Duration::ZERO).await?;

        if acked != 1 {
            warn!(
                stream_id = %stream_id,
                topic = %topic,
                group = %group,
                "XACK returned {}, entry may not be pending",
                acked
            );
        }

        Ok(())
    }

    async fn pending(&self, group: &str, topic: Topic) -> BusResult<Vec<PendingInfo>> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream_key(topic)).arg(group).arg("-").arg("+").arg(1000);
        let reply: Value = self.run("XPENDING", cmd, Duration::ZERO).await?;

        let rows = match reply {
            Value::Nil => return Ok(Vec::new()),
            Value::Array(rows) => rows,
            other => {
                return Err(BusError::Protocol(format!(
                    "unexpected XPENDING reply: {other:?}"
                )))
            }
        };

        let mut infos = Vec::with_capacity(rows.len());
        for row in &rows {
            let parts = match row {
                Value::Array(parts) if parts.len() >= 4 => parts,
                other => {
                    return Err(BusError::Protocol(format!(
                        "malformed XPENDING row: {other:?}"
                    )))
                }
            };

            let stream_id = as_string(&parts[0])
                .ok_or_else(|| BusError::Protocol("pending id is not a string".to_string()))?;
            let consumer = as_string(&parts[1]).ok_or_else(|| {
                BusError::Protocol("pending consumer is not a string".to_string())
            })?;
            let idle_ms = match parts[2] {
                Value::Int(ms) => ms.max(0) as u64,
                _ => 0,
            };
            let delivery_count = match parts[3] {
                Value::Int(count) => count.max(0) as u64,
                _ => 0,
            };

            infos.push(PendingInfo {
                stream_id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
            });
        }

        Ok(infos)
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        topic: Topic,
        min_idle: Duration,
    ) -> BusResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream_key(topic))
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(100);

        let reply: Value = self.run("XAUTOCLAIM", cmd, Duration::ZERO).await?;

        let parts = match reply {
            Value::Array(parts) if parts.len() >= 2 => parts,
            other => {
                return Err(BusError::Protocol(format!(
                    "unexpected XAUTOCLAIM reply: {other:?}"
                )))
            }
        };

        let mut entries = Vec::new();
        for (id, fields) in parse_messages(&parts[1])? {
            match entry_from_fields(topic, id, &fields) {
                Ok(entry) => entries.push(entry),
                Err(BusError::Entry { stream_id, source }) => {
                    warn!(
                        stream_id = %stream_id,
                        error = %source,
                        "Dropping undecodable reclaimed entry"
                    );
                    self.ack(group, topic, &stream_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if !entries.is_empty() {
            info!(
                topic = %topic,
                group = %group,
                count = entries.len(),
                "Reclaimed stale entries"
            );
        }

        Ok(entries)
    }

    async fn scan(
        &self,
        topic: Topic,
        after_id: Option<&str>,
        count: usize,
    ) -> BusResult<Vec<StreamEntry>> {
        let start = match after_id {
            // "(" makes the range exclusive of the cursor itself.
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        };

        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream_key(topic)).arg(&start).arg("+").arg("COUNT").arg(count);
        let reply: Value = self.run("XRANGE", cmd, Duration::ZERO).await?;

        let mut entries = Vec::new();
        for (id, fields) in parse_messages(&reply)? {
            match entry_from_fields(topic, id, &fields) {
                Ok(entry) => entries.push(entry),
                Err(BusError::Entry { stream_id, source }) => {
                    warn!(
                        stream_id = %stream_id,
                        error = %source,
                        "Skipping undecodable entry during scan"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }

    async fn trim(&self, topic: Topic, policy: TrimPolicy) -> BusResult<u64> {
        let min_id = match policy {
            TrimPolicy::MinId(id) => id,
            TrimPolicy::MaxAge(age) => {
                let cutoff_ms = Utc::now().timestamp_millis() - age.as_millis() as i64;
                format!("{}-0", cutoff_ms.max(0))
            }
        };

        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream_key(topic)).arg("MINID").arg(&min_id);
        let trimmed: i64 = self.run("XTRIM", cmd, Duration::ZERO).await?;

        if trimmed > 0 {
            info!(topic = %topic, trimmed, min_id = %min_id, "Trimmed stream");
        }

        Ok(trimmed.max(0) as u64)
    }

    async fn dead_letter(&self, topic: Topic, entry: &DlqEntry) -> BusResult<String> {
        let json = serde_json::to_string(entry)
            .map_err(|e| BusError::Protocol(format!("DLQ entry serialization: {e}")))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(dlq_key(topic)).arg("*").arg(DLQ_FIELD).arg(&json);
        let stream_id: String = self.run("XADD", cmd, Duration::ZERO).await?;

        warn!(
            topic = %topic,
            event_id = %entry.envelope.event_id,
            reason = %entry.last_error,
            "Dead-lettered envelope"
        );

        Ok(stream_id)
    }

    async fn dlq_scan(&self, topic: Topic, count: usize) -> BusResult<Vec<(String, DlqEntry)>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(dlq_key(topic)).arg("-").arg("+").arg("COUNT").arg(count);
        let reply: Value = self.run("XRANGE", cmd, Duration::ZERO).await?;

        let mut entries = Vec::new();
        for (id, fields) in parse_messages(&reply)? {
            let raw = match field(&fields, DLQ_FIELD) {
                Some(raw) => raw,
                None => {
                    warn!(stream_id = %id, "DLQ entry missing payload field");
                    continue;
                }
            };
            match serde_json::from_str::<DlqEntry>(raw) {
                Ok(entry) => entries.push((id, entry)),
                Err(e) => warn!(stream_id = %id, error = %e, "Undecodable DLQ entry"),
            }
        }

        Ok(entries)
    }

    async fn dlq_delete(&self, topic: Topic, stream_id: &str) -> BusResult<u64> {
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(dlq_key(topic)).arg(stream_id);
        let deleted: i64 = self.run("XDEL", cmd, Duration::ZERO).await?;
        Ok(deleted.max(0) as u64)
    }

    async fn dlq_len(&self, topic: Topic) -> BusResult<u64> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(dlq_key(topic));
        let len: i64 = self.run("XLEN", cmd, Duration::ZERO).await?;
        Ok(len.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn message(id: &str, fields: &[(&str, &str)]) -> Value {
        let mut raw = Vec::new();
        for (name, value) in fields {
            raw.push(bulk(name));
            raw.push(bulk(value));
        }
        Value::Array(vec![bulk(id), Value::Array(raw)])
    }

    #[test]
    fn test_parse_messages_shapes() {
        let reply = Value::Array(vec![
            message("1-0", &[("envelope", "{}"), ("extra", "x")]),
            message("2-0", &[("envelope", "{}")]),
        ]);

        let parsed = parse_messages(&reply).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "1-0");
        assert_eq!(parsed[0].1.len(), 2);
        assert_eq!(field(&parsed[1].1, "envelope"), Some("{}"));
    }

    #[test]
    fn test_parse_messages_nil_is_empty() {
        assert!(parse_messages(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_parse_messages_rejects_malformed() {
        let reply = Value::Array(vec![Value::Int(42)]);
        assert!(parse_messages(&reply).is_err());
    }

    #[test]
    fn test_entry_from_fields_decodes_envelope() {
        let envelope = EventEnvelope::new(
            "order_created",
            1,
            "t1",
            "o1",
            "pulse-api",
            serde_json::json!({"total_minor_units": 1}),
        );
        let json = envelope.to_json().unwrap();
        let fields = vec![(ENVELOPE_FIELD.to_string(), json)];

        let entry = entry_from_fields(Topic::Orders, "1-0".to_string(), &fields).unwrap();
        assert_eq!(entry.envelope, envelope);
        assert_eq!(entry.topic, Topic::Orders);
    }

    #[test]
    fn test_entry_from_fields_flags_undecodable_payload() {
        let fields = vec![(ENVELOPE_FIELD.to_string(), "{broken".to_string())];
        match entry_from_fields(Topic::Orders, "1-0".to_string(), &fields) {
            Err(BusError::Entry { stream_id, .. }) => assert_eq!(stream_id, "1-0"),
            other => panic!("expected entry error, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_from_fields_requires_envelope_field() {
        let fields = vec![("other".to_string(), "x".to_string())];
        assert!(matches!(
            entry_from_fields(Topic::Orders, "1-0".to_string(), &fields),
            Err(BusError::Protocol(_))
        ));
    }
}
