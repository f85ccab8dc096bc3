//! Push endpoint wiring shared by both protocols.

use crate::auth::CredentialValidator;
use crate::error::PushResult;
use crate::frames::Channel;
use crate::registry::ConnectionRegistry;
use pulse_bus::StreamBus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::Filter;

/// Lets the push layer signal that a tenant has (re)gained a live
/// connection, without knowing who is listening. The dispatcher manager
/// implements this to lazily start per-tenant consumer loops.
pub trait TenantActivator: Send + Sync {
    fn tenant_active(&self, tenant_id: &str);
}

/// Activator that does nothing (tests, tools).
pub struct NoopActivator;

impl TenantActivator for NoopActivator {
    fn tenant_active(&self, _tenant_id: &str) {}
}

/// Shared state behind the push routes.
pub struct PushState {
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<dyn StreamBus>,
    pub validator: Arc<dyn CredentialValidator>,
    pub activator: Arc<dyn TenantActivator>,
}

/// All push routes: `/stream{,/orders,/notifications}` and
/// `/ws{,/orders}`.
pub fn push_routes(state: Arc<PushState>) -> BoxedFilter<(warp::reply::Response,)> {
    crate::sse::sse_routes(state.clone())
        .or(crate::ws::ws_routes(state))
        .unify()
        .boxed()
}

/// Pull the handshake credential out of the `Authorization: Bearer`
/// header or the `token` query parameter.
pub(crate) fn extract_credential(
    auth_header: Option<&str>,
    query: &HashMap<String, String>,
) -> Option<String> {
    if let Some(header) = auth_header {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    query.get("token").cloned()
}

/// Replay every entry after `after_id` on the channel's topics to one
/// connection, in stream order. Tenant scoping and filter matching
/// happen per entry inside the registry. Returns the number of frames
/// enqueued.
pub(crate) async fn replay_channel(
    state: &PushState,
    connection_id: Uuid,
    channel: Channel,
    after_id: &str,
) -> PushResult<usize> {
    let chunk = state.registry.config().replay_chunk;
    let mut delivered = 0;

    for topic in channel.topics() {
        let mut cursor = after_id.to_string();
        loop {
            let entries = state.bus.scan(*topic, Some(&cursor), chunk).await?;
            let Some(last) = entries.last() else {
                break;
            };
            let next_cursor = last.stream_id.clone();
            let len = entries.len();

            for entry in &entries {
                if state.registry.deliver_entry(connection_id, entry).await? {
                    delivered += 1;
                }
            }

            if len < chunk {
                break;
            }
            cursor = next_cursor;
        }
    }

    debug!(
        connection_id = %connection_id,
        channel = channel.name(),
        after_id = %after_id,
        delivered,
        "Replayed missed events"
    );

    Ok(delivered)
}
