//! Ephemeral SSH key record queries.

use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use crate::db::DatabaseError;

use super::models::{KeyStatus, TempKeyRecord};
use super::Database;

/// Keys live for two hours; after that they are swept regardless of
/// whether the owning run is still alive.
const KEY_TTL_HOURS: i64 = 2;

fn key_from_row(row: &PgRow) -> Result<TempKeyRecord, DatabaseError> {
    let status: String = row.try_get("status")?;
    let servers: serde_json::Value = row.try_get("servers")?;
    let servers: Vec<String> = serde_json::from_value(servers)
        .map_err(|e| DatabaseError::Query(format!("bad servers column: {e}")))?;

    Ok(TempKeyRecord {
        id: row.try_get("id")?,
        key_id: row.try_get("key_id")?,
        public_key: row.try_get("public_key")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        status: status
            .parse::<KeyStatus>()
            .map_err(|e| DatabaseError::Query(e))?,
        cleanup_attempted_at: row.try_get("cleanup_attempted_at")?,
        servers,
    })
}

impl Database {
    /// Persist a freshly generated key with a 2-hour TTL.
    pub async fn create_temp_key(
        &self,
        key_id: &str,
        public_key: &str,
        servers: &[String],
    ) -> Result<TempKeyRecord, DatabaseError> {
        let servers_json = serde_json::to_value(servers)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO temp_ssh_keys (key_id, public_key, expires_at, servers, status)
            VALUES ($1, $2, $3, $4, 'active')
            RETURNING id, key_id, public_key, created_at, expires_at, status,
                      cleanup_attempted_at, servers
            "#,
        )
        .bind(key_id)
        .bind(public_key)
        .bind(Utc::now() + Duration::hours(KEY_TTL_HOURS))
        .bind(servers_json)
        .fetch_one(self.pool())
        .await?;

        debug!(key_id, "temp ssh key registered");
        key_from_row(&row)
    }

    /// Look up a key that is still usable: `active` and not past its TTL.
    pub async fn get_active_key(
        &self,
        key_id: &str,
    ) -> Result<Option<TempKeyRecord>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT id, key_id, public_key, created_at, expires_at, status,
                   cleanup_attempted_at, servers
            FROM temp_ssh_keys
            WHERE key_id = $1 AND status = 'active' AND expires_at > NOW()
            "#,
        )
        .bind(key_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(key_from_row).transpose()
    }

    /// Move a key from `active` to `expired`. A no-op for any other status.
    pub async fn mark_key_expired(&self, key_id: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE temp_ssh_keys SET status = 'expired' WHERE key_id = $1 AND status = 'active'",
        )
        .bind(key_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark a key fully scrubbed and stamp the cleanup attempt.
    pub async fn mark_key_cleaned(&self, key_id: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE temp_ssh_keys SET status = 'cleaned', cleanup_attempted_at = NOW() WHERE key_id = $1",
        )
        .bind(key_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Keys the sweeper must finalize: past-TTL actives, plus expired
    /// records whose cleanup was never attempted.
    pub async fn expired_uncleaned_keys(&self) -> Result<Vec<TempKeyRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT id, key_id, public_key, created_at, expires_at, status,
                   cleanup_attempted_at, servers
            FROM temp_ssh_keys
            WHERE (status = 'active' AND expires_at <= NOW())
               OR (status = 'expired' AND cleanup_attempted_at IS NULL)
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(key_from_row).collect()
    }
}
