//! Server configuration from environment variables.
//!
//! Every knob has a default; `PULSE_*` variables override them.

use pulse_breaker::BreakerConfig;
use pulse_dispatch::{AckPolicy, DispatchConfig};
use pulse_dlq::DlqConfig;
use pulse_outbox::{ReaderConfig, SweeperConfig};
use pulse_push::{Identity, OverflowPolicy, PushConfig, StaticTokenValidator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub database_path: PathBuf,
    pub redis_url: String,
    pub bus_op_timeout: Duration,
    pub reader_workers: usize,
    pub log_level: String,
    /// `token:tenant:user` triples for the static validator.
    pub tokens: Vec<(String, String, String)>,
    pub reader: ReaderConfig,
    pub sweeper: SweeperConfig,
    pub push: PushConfig,
    pub dispatch: DispatchConfig,
    pub dlq: DlqConfig,
    pub breaker: BreakerConfig,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(name, default_ms))
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_or(name, default_secs))
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// documented defaults.
    pub fn from_env() -> Self {
        let overflow_raw =
            std::env::var("PULSE_OVERFLOW_POLICY").unwrap_or_else(|_| "disconnect".to_string());
        let overflow_policy =
            OverflowPolicy::parse(&overflow_raw).unwrap_or(OverflowPolicy::Disconnect);

        let ack_raw =
            std::env::var("PULSE_ACK_POLICY").unwrap_or_else(|_| "best_effort".to_string());
        let ack_policy = AckPolicy::parse(&ack_raw).unwrap_or(AckPolicy::BestEffort);

        // Blocking the dispatcher is only sound when it refuses to ack
        // past a failed delivery.
        let overflow_policy =
            if overflow_policy == OverflowPolicy::Block && ack_policy != AckPolicy::AllConnected {
                warn!("overflow_policy=block requires ack_policy=all_connected; using disconnect");
                OverflowPolicy::Disconnect
            } else {
                overflow_policy
            };

        let tokens = std::env::var("PULSE_TOKENS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|entry| {
                let mut parts = entry.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(token), Some(tenant), Some(user))
                        if !token.is_empty() && !tenant.is_empty() =>
                    {
                        Some((token.to_string(), tenant.to_string(), user.to_string()))
                    }
                    _ => None,
                }
            })
            .collect();

        Self {
            bind: env_or("PULSE_BIND", SocketAddr::from(([127, 0, 0, 1], 8080))),
            database_path: PathBuf::from(
                std::env::var("PULSE_DB_PATH").unwrap_or_else(|_| "pulse.db".to_string()),
            ),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            bus_op_timeout: env_millis("PULSE_BUS_TIMEOUT_MS", 2000),
            reader_workers: env_or("PULSE_READER_WORKERS", 2),
            log_level: std::env::var("PULSE_LOG").unwrap_or_else(|_| "info".to_string()),
            tokens,
            reader: ReaderConfig {
                poll_interval: env_millis("PULSE_OUTBOX_POLL_MS", 100),
                batch_size: env_or("PULSE_OUTBOX_BATCH_SIZE", 100),
                visibility_timeout: env_secs("PULSE_OUTBOX_VISIBILITY_SECS", 30),
                max_attempts: env_or("PULSE_OUTBOX_MAX_ATTEMPTS", 8),
                retry_base: env_millis("PULSE_RETRY_BASE_MS", 1000),
                retry_cap: env_millis("PULSE_RETRY_CAP_MS", 60_000),
            },
            sweeper: SweeperConfig {
                interval: env_secs("PULSE_SWEEP_INTERVAL_SECS", 3600),
                retention: env_secs("PULSE_RETENTION_SECS", 24 * 3600),
            },
            push: PushConfig {
                queue_capacity: env_or("PULSE_QUEUE_CAPACITY", 256),
                overflow_policy,
                heartbeat_general: env_secs("PULSE_HEARTBEAT_GENERAL_SECS", 30),
                heartbeat_orders: env_secs("PULSE_HEARTBEAT_ORDERS_SECS", 45),
                heartbeat_notifications: env_secs("PULSE_HEARTBEAT_NOTIFICATIONS_SECS", 60),
                ..Default::default()
            },
            dispatch: DispatchConfig {
                ack_policy,
                idle_shutdown: env_secs("PULSE_IDLE_SHUTDOWN_SECS", 300),
                ..Default::default()
            },
            dlq: DlqConfig {
                depth_threshold: env_or("PULSE_DLQ_DEPTH_THRESHOLD", 100),
                age_threshold: env_secs("PULSE_DLQ_AGE_THRESHOLD_SECS", 24 * 3600),
                ..Default::default()
            },
            breaker: BreakerConfig {
                failure_ratio: env_or("PULSE_BREAKER_FAILURE_RATIO", 0.5),
                min_samples: env_or("PULSE_BREAKER_MIN_SAMPLES", 20),
                cool_down: env_secs("PULSE_BREAKER_COOL_DOWN_SECS", 30),
                ..Default::default()
            },
        }
    }

    /// Build the static token validator from the configured triples.
    pub fn token_validator(&self) -> StaticTokenValidator {
        let mut validator = StaticTokenValidator::new();
        for (token, tenant, user) in &self.tokens {
            validator.insert(token.clone(), Identity::new(tenant.clone(), user.clone()));
        }
        validator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state; they only read
    // unset variables here to stay order-independent.

    #[test]
    fn test_defaults() {
        let config = Config::from_env();
        assert_eq!(config.reader.batch_size, 100);
        assert_eq!(config.reader.max_attempts, 8);
        assert_eq!(config.reader.poll_interval, Duration::from_millis(100));
        assert_eq!(config.push.queue_capacity, 256);
        assert_eq!(config.push.overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.push.heartbeat_general, Duration::from_secs(30));
        assert_eq!(config.push.heartbeat_orders, Duration::from_secs(45));
        assert_eq!(config.push.heartbeat_notifications, Duration::from_secs(60));
        assert_eq!(config.dispatch.ack_policy, AckPolicy::BestEffort);
        assert_eq!(config.dispatch.idle_shutdown, Duration::from_secs(300));
        assert!((config.breaker.failure_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.breaker.min_samples, 20);
        assert_eq!(config.breaker.cool_down, Duration::from_secs(30));
        assert_eq!(config.bus_op_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_token_validator_built_from_triples() {
        let mut config = Config::from_env();
        config.tokens = vec![("tok-1".to_string(), "t1".to_string(), "u1".to_string())];

        let validator = config.token_validator();
        use pulse_push::CredentialValidator;
        let identity = validator.validate("tok-1").unwrap();
        assert_eq!(identity.tenant_id, "t1");
        assert_eq!(identity.user_id, "u1");
    }
}
