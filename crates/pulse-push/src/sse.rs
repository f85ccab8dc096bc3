//! One-way server-sent event stream endpoint.
//!
//! `GET /stream`, `/stream/orders`, `/stream/notifications`. Frames are
//! `event: <type>\ndata: <json>\n\n` with the bus stream id as the SSE
//! id, so a reconnecting client can hand back `Last-Event-ID` and be
//! replayed. Heartbeats are comment lines on the channel's interval.

use crate::frames::{Channel, PushFrame};
use crate::queue::{CloseReason, OutboundQueue};
use crate::registry::{ConnectionRegistry, Protocol};
use crate::routes::{extract_credential, replay_channel, PushState};
use chrono::Utc;
use futures_util::stream::Stream;
use pulse_envelope::Topic;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// The three SSE routes.
pub fn sse_routes(state: Arc<PushState>) -> BoxedFilter<(warp::reply::Response,)> {
    sse_filter(state.clone(), None, Channel::General)
        .or(sse_filter(state.clone(), Some("orders"), Channel::Orders))
        .unify()
        .or(sse_filter(
            state,
            Some("notifications"),
            Channel::Notifications,
        ))
        .unify()
        .boxed()
}

fn sse_filter(
    state: Arc<PushState>,
    segment: Option<&'static str>,
    channel: Channel,
) -> BoxedFilter<(warp::reply::Response,)> {
    let prefix = warp::path("stream");
    let path = match segment {
        None => prefix.and(warp::path::end()).boxed(),
        Some(segment) => prefix
            .and(warp::path(segment))
            .and(warp::path::end())
            .boxed(),
    };

    warp::get()
        .and(path)
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>("last-event-id"))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(
            move |auth: Option<String>, last_id: Option<String>, query: HashMap<String, String>| {
                let state = state.clone();
                async move {
                    Ok::<_, Rejection>(handle_sse(state, channel, auth, last_id, query).await)
                }
            },
        )
        .boxed()
}

async fn handle_sse(
    state: Arc<PushState>,
    channel: Channel,
    auth_header: Option<String>,
    last_id_header: Option<String>,
    query: HashMap<String, String>,
) -> warp::reply::Response {
    let Some(credential) = extract_credential(auth_header.as_deref(), &query) else {
        return unauthorized("missing credential");
    };

    let identity = match state.validator.validate(&credential) {
        Ok(identity) => identity,
        Err(e) => return unauthorized(&e.to_string()),
    };

    let last_event_id = query
        .get("last_event_id")
        .cloned()
        .or(last_id_header);

    // Seed per-topic cursors so live dispatch cannot race ahead of the
    // replay below.
    let mut cursors = HashMap::new();
    if let Some(id) = &last_event_id {
        for topic in channel.topics() {
            cursors.insert(*topic, id.clone());
        }
    }

    let (connection_id, queue) = state.registry.register(
        &identity,
        Protocol::Sse,
        channel.default_filters(),
        cursors,
    );
    state.activator.tenant_active(&identity.tenant_id);

    if let Some(after_id) = &last_event_id {
        if let Err(e) = replay_channel(&state, connection_id, channel, after_id).await {
            warn!(
                connection_id = %connection_id,
                error = %e,
                "Replay failed, closing stream"
            );
            state
                .registry
                .remove(connection_id, CloseReason::ServerError);
        }
    }

    spawn_expiry_watchdog(
        state.registry.clone(),
        connection_id,
        state.registry.config().heartbeat_for(channel),
    );

    let heartbeat = state.registry.config().heartbeat_for(channel);
    let stream = frame_stream(state.registry.clone(), connection_id, queue);

    warp::sse::reply(
        warp::sse::keep_alive()
            .interval(heartbeat)
            .text("hb")
            .stream(stream),
    )
    .into_response()
}

fn unauthorized(message: &str) -> warp::reply::Response {
    warp::reply::with_status(message.to_string(), StatusCode::UNAUTHORIZED).into_response()
}

/// Enforces credential expiry at heartbeat boundaries. Ends itself when
/// the connection goes away.
fn spawn_expiry_watchdog(
    registry: Arc<ConnectionRegistry>,
    connection_id: Uuid,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            match registry.credential_expired(connection_id, Utc::now()) {
                None => break,
                Some(true) => {
                    registry.remove(connection_id, CloseReason::CredentialExpired);
                    break;
                }
                Some(false) => {}
            }
        }
    });
}

/// Removes the connection record when the response stream is dropped
/// (client went away) or ends (queue closed server-side).
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.connection_id, CloseReason::Normal);
    }
}

fn frame_stream(
    registry: Arc<ConnectionRegistry>,
    connection_id: Uuid,
    queue: Arc<OutboundQueue>,
) -> impl Stream<Item = Result<warp::sse::Event, Infallible>> {
    let guard = ConnectionGuard {
        registry,
        connection_id,
    };

    futures_util::stream::unfold((queue, guard), |(queue, guard)| async move {
        match queue.pop().await {
            Ok(frame) => {
                let event = sse_event(frame);
                Some((Ok(event), (queue, guard)))
            }
            Err(reason) => {
                debug!(
                    connection_id = %guard.connection_id,
                    reason = ?reason,
                    "SSE stream closing"
                );
                None
            }
        }
    })
}

/// The `(event, id, data)` triple an outbound frame renders to on the
/// SSE wire.
fn sse_parts(frame: &PushFrame) -> (String, Option<String>, String) {
    match frame {
        PushFrame::Event {
            stream_id,
            envelope,
            topic: _topic,
        } => (
            envelope.event_type.clone(),
            stream_id.clone(),
            serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string()),
        ),
        other => (
            "message".to_string(),
            None,
            serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
        ),
    }
}

fn sse_event(frame: PushFrame) -> warp::sse::Event {
    let (name, id, data) = sse_parts(&frame);
    let mut event = warp::sse::Event::default().event(name);
    if let Some(id) = id {
        event = event.id(id);
    }
    event.data(data)
}

// The SSE route surface is exercised end-to-end in the server crate's
// integration tests; the pieces unit-tested here are the ones with
// protocol-visible behavior.
#[cfg(test)]
mod tests {
    use super::*;
    use pulse_envelope::EventEnvelope;
    use serde_json::json;

    #[test]
    fn test_sse_parts_for_event_frame() {
        let envelope = EventEnvelope::new(
            "order_created",
            1,
            "t1",
            "o1",
            "pulse-api",
            json!({"total_minor_units": 2998}),
        );
        let frame = PushFrame::Event {
            topic: Topic::Orders,
            stream_id: Some("17-0".to_string()),
            envelope: envelope.clone(),
        };

        let (name, id, data) = sse_parts(&frame);
        assert_eq!(name, "order_created");
        assert_eq!(id.as_deref(), Some("17-0"));
        let decoded = EventEnvelope::from_json(&data).unwrap();
        assert_eq!(decoded.event_id, envelope.event_id);
    }

    #[test]
    fn test_sse_parts_for_control_frame() {
        let (name, id, data) = sse_parts(&PushFrame::Pong { timestamp: Some(1) });
        assert_eq!(name, "message");
        assert!(id.is_none());
        assert!(data.contains("pong"));
    }
}
