//! Pulse server: wires the outbox pipeline, the dispatchers, the push
//! endpoints, and the operational surface into one process.

mod admin;
mod config;

use admin::{admin_routes, AdminState};
use anyhow::Context;
use config::Config;
use pulse_breaker::BreakerRegistry;
use pulse_bus::{RedisStreamBus, StreamBus};
use pulse_database::{DatabasePool, PoolConfig};
use pulse_dispatch::DispatcherManager;
use pulse_dlq::DlqManager;
use pulse_envelope::SchemaRegistry;
use pulse_metrics::Metrics;
use pulse_outbox::{OutboxReader, OutboxSweeper};
use pulse_push::{push_routes, ConnectionRegistry, PushState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_logging(&config.log_level);

    info!(bind = %config.bind, "Starting pulse-server");

    // Process-wide state, constructed explicitly.
    let metrics = Arc::new(Metrics::new());
    let schemas = Arc::new(SchemaRegistry::with_builtin_schemas());

    let pool = Arc::new(
        DatabasePool::open(
            &config.database_path,
            PoolConfig::for_workers(config.reader_workers),
        )
        .context("opening outbox database")?,
    );

    let bus: Arc<dyn StreamBus> = Arc::new(
        RedisStreamBus::connect(&config.redis_url, config.bus_op_timeout)
            .await
            .context("connecting to the stream bus")?,
    );

    let registry = Arc::new(ConnectionRegistry::new(config.push.clone(), metrics.clone()));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    // Pre-register the downstream the handler tasks wrap, so the admin
    // surface can toggle it before the first call.
    breakers.get_or_create("handler");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatchers = Arc::new(DispatcherManager::new(
        bus.clone(),
        registry.clone(),
        schemas.clone(),
        metrics.clone(),
        config.dispatch.clone(),
        shutdown_rx.clone(),
    ));

    // Outbox reader workers.
    let mut worker_handles = Vec::new();
    for _ in 0..config.reader_workers.max(1) {
        let reader = OutboxReader::new(
            pool.clone(),
            bus.clone(),
            schemas.clone(),
            metrics.clone(),
            config.reader.clone(),
        );
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { reader.run(shutdown).await }));
    }

    // Retention sweep.
    {
        let sweeper = OutboxSweeper::new(pool.clone(), bus.clone(), config.sweeper.clone());
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { sweeper.run(shutdown).await }));
    }

    // DLQ monitor.
    let dlq = Arc::new(DlqManager::new(bus.clone(), config.dlq.clone(), metrics.clone()));
    {
        let dlq = dlq.clone();
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move { dlq.run(shutdown).await }));
    }

    // HTTP surface: push endpoints + operational routes.
    let push_state = Arc::new(PushState {
        registry: registry.clone(),
        bus: bus.clone(),
        validator: Arc::new(config.token_validator()),
        activator: dispatchers.clone(),
    });
    let admin_state = Arc::new(AdminState {
        pool: pool.clone(),
        bus: bus.clone(),
        registry: registry.clone(),
        dlq: dlq.clone(),
        breakers: breakers.clone(),
        dispatchers: dispatchers.clone(),
        metrics: metrics.clone(),
    });

    let routes = push_routes(push_state).or(admin_routes(admin_state)).unify();

    let (addr, server) =
        warp::serve(routes).bind_with_graceful_shutdown(config.bind, async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        });
    info!(addr = %addr, "HTTP surface listening");

    server.await;

    // Stop the workers, let in-flight batches finish.
    let _ = shutdown_tx.send(true);
    dispatchers.join_all().await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("pulse-server stopped");
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
