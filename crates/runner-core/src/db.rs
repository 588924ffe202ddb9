//! Postgres connection pool setup.
//!
//! The connection URI comes decrypted from the license service; this module
//! only knows how to open a pool with the sizing the installation flow
//! expects and run the schema migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

/// Database errors shared across the host and key stores.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Open a Postgres pool against the given URI.
///
/// Pool sizing: 10 max / 5 min connections, 30-minute idle timeout,
/// 1-hour connection lifetime, 5-second acquire timeout. The pool is
/// pinged once before being handed out.
pub async fn open_pool(uri: &str) -> Result<PgPool, DatabaseError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(5)
        .idle_timeout(Duration::from_secs(30 * 60))
        .max_lifetime(Duration::from_secs(60 * 60))
        .acquire_timeout(Duration::from_secs(5))
        .connect(uri)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!("database pool opened");

    Ok(pool)
}

/// Run the schema migrations for the `servers` and `temp_ssh_keys` tables.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    info!("database migrations complete");
    Ok(())
}

/// Take the transaction-scoped advisory lock for a machine id.
///
/// Serializes checkpoint writes for the same host across competing workers
/// and orchestrator processes. Released automatically at commit/rollback.
pub async fn advisory_lock(
    tx: &mut Transaction<'_, Postgres>,
    machine_id: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_key(machine_id))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// 64-bit FNV-1a hash of the machine id, reinterpreted as the signed
/// integer Postgres advisory locks are keyed by.
#[allow(clippy::cast_possible_wrap)]
pub fn lock_key(machine_id: &str) -> i64 {
    use std::hash::Hasher;

    let mut hasher = fnv::FnvHasher::default();
    hasher.write(machine_id.as_bytes());
    hasher.finish() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable() {
        assert_eq!(lock_key("machine-a"), lock_key("machine-a"));
    }

    #[test]
    fn lock_key_distinguishes_machines() {
        assert_ne!(lock_key("machine-a"), lock_key("machine-b"));
    }

    #[test]
    fn lock_key_matches_fnv1a_reference() {
        // FNV-1a of the empty string is the 64-bit offset basis.
        assert_eq!(lock_key("") as u64, 0xcbf2_9ce4_8422_2325);
    }
}
