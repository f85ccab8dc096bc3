//! Bidirectional socket endpoint.
//!
//! `GET /ws` and `/ws/orders`. After the handshake the client may send
//! `{subscribe, unsubscribe, ping, stats}` control frames; the server
//! replies with `{event, pong, stats, error}` frames. Server pings on
//! the channel heartbeat interval double as liveness: a pong missed for
//! two intervals closes the connection with the liveness code.

use crate::frames::{Channel, ClientFrame, PushFrame};
use crate::queue::{CloseReason, OutboundQueue};
use crate::registry::Protocol;
use crate::routes::{extract_credential, replay_channel, PushState};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

/// Close code for a failed handshake credential.
const CLOSE_CREDENTIAL: u16 = 1008;

/// The WebSocket routes.
pub fn ws_routes(state: Arc<PushState>) -> BoxedFilter<(warp::reply::Response,)> {
    ws_filter(state.clone(), None, Channel::General)
        .or(ws_filter(state, Some("orders"), Channel::Orders))
        .unify()
        .boxed()
}

fn ws_filter(
    state: Arc<PushState>,
    segment: Option<&'static str>,
    channel: Channel,
) -> BoxedFilter<(warp::reply::Response,)> {
    let prefix = warp::path("ws");
    let path = match segment {
        None => prefix.and(warp::path::end()).boxed(),
        Some(segment) => prefix
            .and(warp::path(segment))
            .and(warp::path::end())
            .boxed(),
    };

    warp::get()
        .and(path)
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .map(
            move |ws: warp::ws::Ws, auth: Option<String>, query: HashMap<String, String>| {
                let state = state.clone();
                ws.on_upgrade(move |socket| handle_socket(state, channel, auth, query, socket))
                    .into_response()
            },
        )
        .boxed()
}

async fn handle_socket(
    state: Arc<PushState>,
    channel: Channel,
    auth_header: Option<String>,
    query: HashMap<String, String>,
    socket: WebSocket,
) {
    let (mut sink, mut stream) = socket.split();

    // Credential failures close with 1008 per the wire contract.
    let identity = match extract_credential(auth_header.as_deref(), &query)
        .ok_or(crate::auth::AuthError::MissingCredential)
        .and_then(|credential| state.validator.validate(&credential))
    {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "WebSocket handshake rejected");
            let _ = sink
                .send(Message::close_with(CLOSE_CREDENTIAL, e.to_string()))
                .await;
            return;
        }
    };

    let (connection_id, queue) = state.registry.register(
        &identity,
        Protocol::WebSocket,
        channel.default_filters(),
        HashMap::new(),
    );
    state.activator.tenant_active(&identity.tenant_id);

    let heartbeat = state.registry.config().heartbeat_for(channel);
    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));

    // Single writer: drains the outbound queue and owns the sink, so
    // per-connection delivery order is the queue order.
    let writer = {
        let state = state.clone();
        let queue = queue.clone();
        let last_pong = last_pong.clone();

        tokio::spawn(async move {
            let mut ping_timer = tokio::time::interval(heartbeat);
            ping_timer.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    frame = queue.pop() => match frame {
                        Ok(frame) => {
                            let json = match serde_json::to_string(&frame) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(error = %e, "Dropping unserializable frame");
                                    continue;
                                }
                            };
                            if sink.send(Message::text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(reason) => {
                            let _ = sink
                                .send(Message::close_with(reason.close_code(), reason.as_str()))
                                .await;
                            break;
                        }
                    },
                    _ = ping_timer.tick() => {
                        // Heartbeat boundary: enforce credential expiry
                        // and pong liveness, then ping.
                        match state.registry.credential_expired(connection_id, Utc::now()) {
                            None => {
                                // Record already gone; flush the close.
                                queue.close(CloseReason::Normal);
                                continue;
                            }
                            Some(true) => {
                                info!(connection_id = %connection_id, "Credential expired");
                                state.registry.remove(connection_id, CloseReason::CredentialExpired);
                                continue;
                            }
                            Some(false) => {}
                        }

                        let idle = last_pong.lock().expect("lock poisoned").elapsed();
                        if idle > heartbeat * 2 {
                            info!(
                                connection_id = %connection_id,
                                idle_ms = idle.as_millis() as u64,
                                "Missed pongs, closing for liveness"
                            );
                            state.registry.remove(connection_id, CloseReason::Liveness);
                            continue;
                        }

                        if sink.send(Message::ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Reader: control frames and liveness signals.
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        };

        // Any inbound traffic proves the peer is alive.
        *last_pong.lock().expect("lock poisoned") = Instant::now();

        if message.is_close() {
            break;
        }
        if message.is_pong() || message.is_ping() {
            continue;
        }

        let Ok(text) = message.to_str() else {
            continue;
        };
        handle_client_frame(&state, connection_id, channel, &queue, text).await;
    }

    // Normal teardown; a server-initiated close already removed the
    // record and this is a no-op.
    state.registry.remove(connection_id, CloseReason::Normal);
    let _ = writer.await;

    debug!(connection_id = %connection_id, "WebSocket connection finished");
}

async fn handle_client_frame(
    state: &Arc<PushState>,
    connection_id: Uuid,
    channel: Channel,
    queue: &Arc<OutboundQueue>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = queue.push_control(PushFrame::Error {
                code: "bad_frame".to_string(),
                message: e.to_string(),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe {
            filters,
            last_event_id,
        } => {
            if let Err(e) = state.registry.subscribe(connection_id, &filters) {
                warn!(connection_id = %connection_id, error = %e, "Subscribe failed");
                return;
            }
            debug!(connection_id = %connection_id, filters = ?filters, "Subscribed");

            if let Some(after_id) = last_event_id {
                if let Err(e) = replay_channel(state, connection_id, channel, &after_id).await {
                    warn!(connection_id = %connection_id, error = %e, "Replay failed");
                }
            }
        }
        ClientFrame::Unsubscribe { filters } => {
            if let Err(e) = state.registry.unsubscribe(connection_id, &filters) {
                warn!(connection_id = %connection_id, error = %e, "Unsubscribe failed");
            }
        }
        ClientFrame::Ping { timestamp } => {
            let _ = queue.push_control(PushFrame::Pong { timestamp });
        }
        ClientFrame::Stats => match state.registry.stats_frame(connection_id) {
            Ok(frame) => {
                let _ = queue.push_control(frame);
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Stats failed");
            }
        },
    }
}
