//! Named breaker registry.
//!
//! Process-wide lookup for breakers wrapping distinct downstreams, built
//! explicitly at startup and shared with the admin surface (manual
//! open/close) and the metrics publisher (`circuit_state` gauge).

use crate::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of named circuit breakers.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the breaker for a downstream, creating it with the default
    /// config on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("lock poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Look up an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .expect("lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshots of every registered breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().expect("lock poisoned");
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
