//! The event envelope wire contract.

use crate::error::EnvelopeResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stream topics events are routed onto.
///
/// Routing is derived from the `event_type` prefix; anything without a
/// dedicated topic lands on `system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Orders,
    Notifications,
    System,
}

impl Topic {
    /// All topics, in dispatch order.
    pub const ALL: [Topic; 3] = [Topic::Orders, Topic::Notifications, Topic::System];

    /// Derive the topic for an event type.
    pub fn for_event_type(event_type: &str) -> Topic {
        if event_type.starts_with("order_") {
            Topic::Orders
        } else if event_type.starts_with("notification_") {
            Topic::Notifications
        } else {
            Topic::System
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Orders => "orders",
            Topic::Notifications => "notifications",
            Topic::System => "system",
        }
    }

    /// Parse a topic name as it appears in stream keys and admin URLs.
    pub fn parse(name: &str) -> Option<Topic> {
        match name {
            "orders" => Some(Topic::Orders),
            "notifications" => Some(Topic::Notifications),
            "system" => Some(Topic::System),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical event envelope.
///
/// `event_id` is globally unique and is the idempotency key for the whole
/// pipeline: the outbox rejects duplicates on insert and consumers de-dup
/// on it after redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub schema_version: u32,
    pub tenant_id: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Create a new envelope with a fresh `event_id`, stamped now.
    pub fn new(
        event_type: impl Into<String>,
        schema_version: u32,
        tenant_id: impl Into<String>,
        aggregate_id: impl Into<String>,
        producer: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            schema_version,
            tenant_id: tenant_id.into(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Utc::now(),
            producer: producer.into(),
            trace_id: None,
            user_id: None,
            payload,
        }
    }

    /// The stream topic this envelope routes onto.
    pub fn topic(&self) -> Topic {
        Topic::for_event_type(&self.event_type)
    }

    /// Serialize the envelope to its wire form (self-describing JSON).
    pub fn to_json(&self) -> EnvelopeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize an envelope from its wire form.
    pub fn from_json(json: &str) -> EnvelopeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_envelope() -> EventEnvelope {
        EventEnvelope::new(
            "order_created",
            1,
            "tenant-1",
            "order-42",
            "pulse-api",
            json!({
                "items": [{"sku": "SKU-1", "quantity": 2}],
                "total_minor_units": 2998,
                "currency": "EUR",
            }),
        )
    }

    #[test]
    fn test_topic_routing_by_prefix() {
        assert_eq!(Topic::for_event_type("order_created"), Topic::Orders);
        assert_eq!(Topic::for_event_type("order_cancelled"), Topic::Orders);
        assert_eq!(
            Topic::for_event_type("notification_sent"),
            Topic::Notifications
        );
        assert_eq!(Topic::for_event_type("user_registered"), Topic::System);
        assert_eq!(Topic::for_event_type(""), Topic::System);
    }

    #[test]
    fn test_topic_parse_roundtrip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("payments"), None);
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let envelope = order_envelope();
        let json = envelope.to_json().unwrap();
        let decoded = EventEnvelope::from_json(&json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_optional_fields_omitted() {
        let envelope = order_envelope();
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("trace_id"));
        assert!(!json.contains("user_id"));

        let mut with_correlation = order_envelope();
        with_correlation.trace_id = Some("trace-1".to_string());
        with_correlation.user_id = Some("user-7".to_string());
        let json = with_correlation.to_json().unwrap();
        assert!(json.contains("trace-1"));
        assert!(json.contains("user-7"));
    }

    #[test]
    fn test_envelope_topic() {
        assert_eq!(order_envelope().topic(), Topic::Orders);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(EventEnvelope::from_json("not json").is_err());
        assert!(EventEnvelope::from_json("{}").is_err());
    }
}
