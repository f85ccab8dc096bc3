//! Wire frames for both push protocols.

use pulse_envelope::{EventEnvelope, Topic};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A push channel, selected by route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    General,
    Orders,
    Notifications,
}

impl Channel {
    /// Topics this channel is fed from.
    pub fn topics(&self) -> &'static [Topic] {
        match self {
            Channel::General => &Topic::ALL,
            Channel::Orders => &[Topic::Orders],
            Channel::Notifications => &[Topic::Notifications],
        }
    }

    /// Default subscription filters for connections on this channel.
    pub fn default_filters(&self) -> Vec<String> {
        match self {
            Channel::General => vec!["*".to_string()],
            Channel::Orders => vec!["order_*".to_string()],
            Channel::Notifications => vec!["notification_*".to_string()],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::General => "general",
            Channel::Orders => "orders",
            Channel::Notifications => "notifications",
        }
    }
}

/// Server-to-client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Event {
        topic: Topic,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        envelope: EventEnvelope,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Stats {
        connection_id: Uuid,
        tenant_id: String,
        subscriptions: Vec<String>,
        queue_depth: usize,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Client-to-server control frame (bidirectional socket only).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        filters: Vec<String>,
        #[serde(default)]
        last_event_id: Option<String>,
    },
    Unsubscribe {
        filters: Vec<String>,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Stats,
}

/// Match an event type against a subscription glob.
///
/// Supported shapes: exact match, `*` (everything), `prefix_*`, and
/// `*_suffix`.
pub fn glob_match(filter: &str, event_type: &str) -> bool {
    if filter == "*" {
        return true;
    }
    if let Some(prefix) = filter.strip_suffix('*') {
        return event_type.starts_with(prefix);
    }
    if let Some(suffix) = filter.strip_prefix('*') {
        return event_type.ends_with(suffix);
    }
    filter == event_type
}
