//! Host record queries.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use crate::db::{advisory_lock, DatabaseError};

use super::models::{HostRecord, HostRole, HostStatus, InstallStep};
use super::Database;

fn host_from_row(row: &PgRow) -> Result<HostRecord, DatabaseError> {
    let parse = |field: &str, value: String| {
        DatabaseError::Query(format!("bad {field} column: {value}"))
    };

    let role: String = row.try_get("role")?;
    let status: String = row.try_get("status")?;
    let step: String = row.try_get("step")?;

    Ok(HostRecord {
        machine_id: row.try_get("machine_id")?,
        public_ip: row.try_get("public_ip")?,
        private_ip: row.try_get("private_ip")?,
        role: role.parse::<HostRole>().map_err(|_| parse("role", role))?,
        status: status
            .parse::<HostStatus>()
            .map_err(|_| parse("status", status))?,
        identifier: row.try_get("identifier")?,
        step: step.parse::<InstallStep>().map_err(|_| parse("step", step))?,
        consul_address: row.try_get("consul_address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Register a host, or refresh it if it already exists.
    ///
    /// Upsert on `machine_id`: conflicting rows only have `status` and
    /// `updated_at` overwritten, so a re-run never resets `step`.
    pub async fn register_host(
        &self,
        machine_id: &str,
        public_ip: &str,
        private_ip: &str,
        role: HostRole,
        identifier: &str,
        step: InstallStep,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        advisory_lock(&mut tx, machine_id).await?;

        sqlx::query(
            r#"
            INSERT INTO servers (machine_id, public_ip, private_ip, role, status, identifier, step, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (machine_id) DO UPDATE
            SET status = $5, updated_at = $8
            "#,
        )
        .bind(machine_id)
        .bind(public_ip)
        .bind(private_ip)
        .bind(role.as_str())
        .bind(HostStatus::Active.as_str())
        .bind(identifier)
        .bind(step.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(machine_id, role = role.as_str(), "host registered");
        Ok(())
    }

    /// Overwrite a host's checkpoint. The caller guarantees monotonicity.
    ///
    /// Fails with [`DatabaseError::NotFound`] when no row matched, so a
    /// checkpoint can never silently vanish.
    pub async fn update_step(
        &self,
        machine_id: &str,
        step: InstallStep,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        advisory_lock(&mut tx, machine_id).await?;

        let result = sqlx::query(
            "UPDATE servers SET step = $1, updated_at = $2 WHERE machine_id = $3",
        )
        .bind(step.as_str())
        .bind(Utc::now())
        .bind(machine_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "no host record for machine_id {machine_id}"
            )));
        }

        tx.commit().await?;
        debug!(machine_id, step = step.as_str(), "step checkpointed");
        Ok(())
    }

    /// Current checkpoint for a host under a subscription, or `None` when
    /// the host was never registered (caller then registers at
    /// `Initialized`).
    pub async fn get_step(
        &self,
        machine_id: &str,
        identifier: &str,
    ) -> Result<Option<InstallStep>, DatabaseError> {
        let row = sqlx::query(
            "SELECT step FROM servers WHERE machine_id = $1 AND identifier = $2",
        )
        .bind(machine_id)
        .bind(identifier)
        .fetch_optional(self.pool())
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let step: String = row.try_get("step")?;
                let step = step
                    .parse::<InstallStep>()
                    .map_err(|e| DatabaseError::Query(e))?;
                Ok(Some(step))
            }
        }
    }

    /// All active host records, oldest first.
    pub async fn get_active_hosts(&self) -> Result<Vec<HostRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT machine_id, public_ip, private_ip, role, status, identifier,
                   step, consul_address, created_at, updated_at
            FROM servers
            WHERE status = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(host_from_row).collect()
    }

    /// Record the elected consul server's address on its host record.
    pub async fn save_consul_address(
        &self,
        address: &str,
        machine_id: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        advisory_lock(&mut tx, machine_id).await?;

        let result = sqlx::query(
            "UPDATE servers SET consul_address = $1, updated_at = $2 WHERE machine_id = $3",
        )
        .bind(address)
        .bind(Utc::now())
        .bind(machine_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "no host record for machine_id {machine_id}"
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    /// The recorded consul server address, if any host has been elected.
    pub async fn get_consul_address(&self) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query(
            "SELECT consul_address FROM servers WHERE consul_address IS NOT NULL LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row.try_get("consul_address")?)),
        }
    }
}
