//! Lazy per-tenant dispatcher lifecycle.

use crate::dispatcher::{DispatchConfig, TenantDispatcher};
use pulse_bus::StreamBus;
use pulse_envelope::SchemaRegistry;
use pulse_metrics::Metrics;
use pulse_push::{ConnectionRegistry, TenantActivator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns and tracks one [`TenantDispatcher`] per active tenant.
///
/// The push endpoints signal tenant activity through the
/// [`TenantActivator`] seam; dispatcher loops shut themselves down after
/// their tenant goes idle and are respawned on the next connection.
pub struct DispatcherManager {
    bus: Arc<dyn StreamBus>,
    registry: Arc<ConnectionRegistry>,
    schemas: Arc<SchemaRegistry>,
    metrics: Arc<Metrics>,
    config: DispatchConfig,
    shutdown: watch::Receiver<bool>,
    tenants: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DispatcherManager {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        registry: Arc<ConnectionRegistry>,
        schemas: Arc<SchemaRegistry>,
        metrics: Arc<Metrics>,
        config: DispatchConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            registry,
            schemas,
            metrics,
            config,
            shutdown,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a dispatcher loop exists for the tenant.
    pub fn ensure_tenant(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().expect("lock poisoned");

        // Reap loops that idled out so a returning tenant gets a fresh
        // one.
        tenants.retain(|_, handle| !handle.is_finished());

        if tenants.contains_key(tenant_id) {
            return;
        }

        debug!(tenant_id = %tenant_id, "Spawning tenant dispatcher");
        let dispatcher = TenantDispatcher::new(
            tenant_id,
            self.bus.clone(),
            self.registry.clone(),
            self.schemas.clone(),
            self.metrics.clone(),
            self.config.clone(),
        );
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(dispatcher.run(shutdown));
        tenants.insert(tenant_id.to_string(), handle);
    }

    /// Tenants with a live dispatcher loop.
    pub fn active_tenants(&self) -> Vec<String> {
        let mut tenants = self.tenants.lock().expect("lock poisoned");
        tenants.retain(|_, handle| !handle.is_finished());
        let mut names: Vec<_> = tenants.keys().cloned().collect();
        names.sort();
        names
    }

    /// Wait for every dispatcher loop to finish (after the shutdown
    /// watch flipped).
    pub async fn join_all(&self) {
        let handles: Vec<_> = {
            let mut tenants = self.tenants.lock().expect("lock poisoned");
            tenants.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl TenantActivator for DispatcherManager {
    fn tenant_active(&self, tenant_id: &str) {
        self.ensure_tenant(tenant_id);
    }
}
