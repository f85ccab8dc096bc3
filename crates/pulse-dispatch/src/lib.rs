//! Consumer-group dispatcher.
//!
//! One loop per `(subsystem, tenant)` consumer group, started lazily
//! when the tenant's first push connection appears and stopped after the
//! tenant has been without connections for a grace period. Each loop
//! pulls batches from the bus, filters out foreign tenants,
//! absorbs redelivery duplicates by `event_id`, fans entries out through
//! the connection registry, and acknowledges per the configured policy.

pub mod dedup;
pub mod dispatcher;
pub mod manager;

pub use dedup::DedupRing;
pub use dispatcher::{AckPolicy, DispatchConfig, TenantDispatcher};
pub use manager::DispatcherManager;
