//! Operational surface: metrics scrape, health probe, and the admin API.
//!
//! Admin operations: list DLQ entries, reprocess them, dump registry
//! stats, and force a circuit open or closed.

use pulse_breaker::BreakerRegistry;
use pulse_bus::StreamBus;
use pulse_database::DatabasePool;
use pulse_dispatch::DispatcherManager;
use pulse_dlq::{DlqManager, ReprocessFilter};
use pulse_envelope::Topic;
use pulse_metrics::Metrics;
use pulse_push::ConnectionRegistry;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// State shared by the operational routes.
pub struct AdminState {
    pub pool: Arc<DatabasePool>,
    pub bus: Arc<dyn StreamBus>,
    pub registry: Arc<ConnectionRegistry>,
    pub dlq: Arc<DlqManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub dispatchers: Arc<DispatcherManager>,
    pub metrics: Arc<Metrics>,
}

/// Body of `POST /admin/dlq/{topic}/reprocess`.
#[derive(Debug, Deserialize, Default)]
pub struct ReprocessRequest {
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub fixed_payload: Option<serde_json::Value>,
}

/// `/metrics`, `/healthz`, and `/admin/...`.
pub fn admin_routes(state: Arc<AdminState>) -> BoxedFilter<(warp::reply::Response,)> {
    let metrics = {
        let state = state.clone();
        warp::get()
            .and(warp::path("metrics"))
            .and(warp::path::end())
            .map(move || {
                // Refresh the circuit gauges right before the scrape.
                for snapshot in state.breakers.snapshots() {
                    state
                        .metrics
                        .circuit_state
                        .set(&snapshot.name, snapshot.state.as_gauge());
                }
                warp::reply::with_header(
                    state.metrics.render(),
                    "content-type",
                    "text/plain; version=0.0.4",
                )
                .into_response()
            })
    };

    let healthz = {
        let state = state.clone();
        warp::get()
            .and(warp::path("healthz"))
            .and(warp::path::end())
            .and_then(move || {
                let state = state.clone();
                async move { Ok::<_, Rejection>(handle_health(state).await) }
            })
    };

    let dlq_list = {
        let state = state.clone();
        warp::get()
            .and(warp::path("admin"))
            .and(warp::path("dlq"))
            .and(warp::path::param::<String>())
            .and(warp::path::end())
            .and(warp::query::<HashMap<String, String>>())
            .and_then(move |topic: String, query: HashMap<String, String>| {
                let state = state.clone();
                async move { Ok::<_, Rejection>(handle_dlq_list(state, topic, query).await) }
            })
    };

    let dlq_reprocess = {
        let state = state.clone();
        warp::post()
            .and(warp::path("admin"))
            .and(warp::path("dlq"))
            .and(warp::path::param::<String>())
            .and(warp::path("reprocess"))
            .and(warp::path::end())
            .and(warp::body::json::<ReprocessRequest>())
            .and_then(move |topic: String, request: ReprocessRequest| {
                let state = state.clone();
                async move { Ok::<_, Rejection>(handle_reprocess(state, topic, request).await) }
            })
    };

    let registry_stats = {
        let state = state.clone();
        warp::get()
            .and(warp::path("admin"))
            .and(warp::path("registry"))
            .and(warp::path::end())
            .map(move || {
                let stats = state.registry.stats();
                let body = json!({
                    "registry": stats,
                    "active_dispatchers": state.dispatchers.active_tenants(),
                });
                warp::reply::json(&body).into_response()
            })
    };

    let circuits = {
        let state = state.clone();
        warp::get()
            .and(warp::path("admin"))
            .and(warp::path("circuits"))
            .and(warp::path::end())
            .map(move || {
                let snapshots: Vec<_> = state
                    .breakers
                    .snapshots()
                    .into_iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "state": format!("{:?}", s.state),
                            "total_calls": s.total_calls,
                            "failure_count": s.failure_count,
                            "failure_rate": s.failure_rate,
                        })
                    })
                    .collect();
                warp::reply::json(&snapshots).into_response()
            })
    };

    let circuit_toggle = {
        let state = state.clone();
        warp::post()
            .and(warp::path("admin"))
            .and(warp::path("circuit"))
            .and(warp::path::param::<String>())
            .and(warp::path::param::<String>())
            .and(warp::path::end())
            .map(move |name: String, action: String| {
                handle_circuit_toggle(&state, &name, &action)
            })
    };

    metrics
        .or(healthz)
        .unify()
        .or(dlq_list)
        .unify()
        .or(dlq_reprocess)
        .unify()
        .or(registry_stats)
        .unify()
        .or(circuits)
        .unify()
        .or(circuit_toggle)
        .unify()
        .boxed()
}

async fn handle_health(state: Arc<AdminState>) -> warp::reply::Response {
    let database_ok = state.pool.health_check().is_ok();
    let bus_ok = state.bus.ping().await.is_ok();
    let healthy = database_ok && bus_ok;

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "database": database_ok,
        "bus": bus_ok,
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

async fn handle_dlq_list(
    state: Arc<AdminState>,
    topic: String,
    query: HashMap<String, String>,
) -> warp::reply::Response {
    let Some(topic) = Topic::parse(&topic) else {
        return bad_request("unknown topic");
    };
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(100);

    match state.dlq.list(topic, limit).await {
        Ok(entries) => {
            let body: Vec<_> = entries
                .into_iter()
                .map(|(stream_id, entry)| {
                    json!({
                        "stream_id": stream_id,
                        "event_id": entry.envelope.event_id,
                        "event_type": entry.envelope.event_type,
                        "tenant_id": entry.envelope.tenant_id,
                        "first_failed_at": entry.first_failed_at,
                        "last_error": entry.last_error,
                        "attempt_count": entry.attempt_count,
                        "origin_stream": entry.origin_stream,
                    })
                })
                .collect();
            warp::reply::json(&body).into_response()
        }
        Err(e) => server_error(&e.to_string()),
    }
}

async fn handle_reprocess(
    state: Arc<AdminState>,
    topic: String,
    request: ReprocessRequest,
) -> warp::reply::Response {
    let Some(topic) = Topic::parse(&topic) else {
        return bad_request("unknown topic");
    };

    let filter = ReprocessFilter {
        event_id: request.event_id,
        event_type: request.event_type,
    };
    let limit = request.limit.unwrap_or(100);

    match state
        .dlq
        .reprocess(topic, &filter, limit, request.fixed_payload)
        .await
    {
        Ok(report) => warp::reply::json(&report).into_response(),
        Err(e) => server_error(&e.to_string()),
    }
}

fn handle_circuit_toggle(state: &AdminState, name: &str, action: &str) -> warp::reply::Response {
    let Some(breaker) = state.breakers.get(name) else {
        return warp::reply::with_status("unknown circuit".to_string(), StatusCode::NOT_FOUND)
            .into_response();
    };

    match action {
        "open" => breaker.force_open(),
        "close" => breaker.force_close(),
        _ => return bad_request("action must be open or close"),
    }

    warp::reply::json(&json!({
        "name": name,
        "state": format!("{:?}", breaker.state()),
    }))
    .into_response()
}

fn bad_request(message: &str) -> warp::reply::Response {
    warp::reply::with_status(message.to_string(), StatusCode::BAD_REQUEST).into_response()
}

fn server_error(message: &str) -> warp::reply::Response {
    warp::reply::with_status(message.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}
