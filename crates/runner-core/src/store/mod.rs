//! Durable state store for hosts and ephemeral SSH keys.
//!
//! One [`Database`] handle wraps the Postgres pool; host-record writes are
//! serialized per machine through transaction-scoped advisory locks so that
//! two workers (or two orchestrator processes) racing on the same host
//! produce a linear sequence of checkpoints.

mod hosts;
mod keys;
mod models;

pub use models::{
    HostRecord, HostRole, HostStatus, InstallStep, KeyStatus, TempKeyRecord,
};

use sqlx::PgPool;

use crate::db::{self, DatabaseError};

/// Handle to the shared Postgres state store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the store and run migrations.
    pub async fn connect(uri: &str) -> Result<Self, DatabaseError> {
        let pool = db::open_pool(uri).await?;
        db::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-opened pool (for tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for in-flight queries to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
