//! Connection pool for the outbox store.
//!
//! The outbox has one access pattern: short write bursts (API inserts
//! joining business transactions, reader claim/mark updates, the hourly
//! sweep) against a table that is also scanned for lag gauges. WAL mode
//! fits that exactly: claim and mark statements serialize on the single
//! writer while the gauge reads keep going.
//!
//! Durability is stricter here than for a cache or a session store. An
//! outbox row is the only record of an undelivered event, so commits
//! run with `synchronous = FULL`: a power cut after the business
//! transaction returned must not be able to take the event with it.

use crate::{migrations, DatabaseError, DatabaseResult};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Pool sizing and acquire deadline.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections.
    pub max_size: u32,
    /// How long a caller may wait for a free connection. This is the
    /// database-call deadline; a saturated pool surfaces as
    /// [`DatabaseError::Connection`] instead of an unbounded stall.
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Size the pool for a given number of outbox reader workers, plus
    /// headroom for the sweeper, the admin surface, and API inserts.
    pub fn for_workers(reader_workers: usize) -> Self {
        Self {
            max_size: (reader_workers as u32).saturating_add(4),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_workers(2)
    }
}

/// Pooled handle to the outbox database.
pub struct DatabasePool {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabasePool {
    /// Open (creating if needed) the outbox database at `path`, apply
    /// pending migrations, and start the pool.
    pub fn open(path: &Path, config: PoolConfig) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // WAL so gauge reads never block claim/mark writes; FULL so
            // a committed outbox row survives power loss; busy_timeout
            // matched to the acquire deadline so writer contention
            // resolves by waiting instead of erroring.
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = FULL;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.acquire_timeout)
            .build(manager)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        {
            let conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            migrations::run_migrations(&conn)?;
        }

        info!(
            path = %path.display(),
            connections = config.max_size,
            "Outbox database ready"
        );

        Ok(Self { pool })
    }

    /// Borrow a connection, waiting up to the acquire deadline.
    pub fn get(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))
    }

    /// Verify the store is usable: a connection can be acquired and the
    /// outbox table is present (migrations ran).
    pub fn health_check(&self) -> DatabaseResult<()> {
        let conn = self.get()?;
        let outbox_tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'outbox'",
            [],
            |row| row.get(0),
        )?;
        if outbox_tables != 1 {
            return Err(DatabaseError::Migration(
                "outbox table missing".to_string(),
            ));
        }
        Ok(())
    }
}
