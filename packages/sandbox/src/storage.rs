// ABOUTME: Storage layer for tenant sandbox records in SQLite
// ABOUTME: One row per tenant with engine id, deterministic name, status and activity timestamps

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use warden_config::ResourceTier;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Sandbox not found for tenant: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid tier: {0}")]
    InvalidTier(String),
    #[error("Invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Destroyed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "destroyed" => Ok(Self::Destroyed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted sandbox record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub tenant_id: String,
    pub engine_id: Option<String>,
    pub name: String,
    pub status: SandboxStatus,
    pub tier: ResourceTier,
    /// Engine volume holding the tenant workspace
    pub workspace_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(
        tenant_id: &str,
        name: String,
        tier: ResourceTier,
        workspace_path: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("sbx_{}", uuid::Uuid::new_v4().to_string().replace('-', "")),
            tenant_id: tenant_id.to_string(),
            engine_id: None,
            name,
            status: SandboxStatus::Creating,
            tier,
            workspace_path,
            created_at: now,
            last_activity_at: now,
        }
    }
}

pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a sandbox, replacing any row the tenant already has
    pub async fn upsert(&self, sandbox: &Sandbox) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, tenant_id, engine_id, name, status, tier, workspace_path,
                created_at, last_activity_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(tenant_id) DO UPDATE SET
                id = excluded.id,
                engine_id = excluded.engine_id,
                name = excluded.name,
                status = excluded.status,
                tier = excluded.tier,
                workspace_path = excluded.workspace_path,
                created_at = excluded.created_at,
                last_activity_at = excluded.last_activity_at
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.tenant_id)
        .bind(&sandbox.engine_id)
        .bind(&sandbox.name)
        .bind(sandbox.status.as_str())
        .bind(sandbox.tier.as_str())
        .bind(&sandbox.workspace_path)
        .bind(timestamp(&sandbox.created_at))
        .bind(timestamp(&sandbox.last_activity_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_tenant(&self, tenant_id: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, engine_id, name, status, tier, workspace_path,
                   created_at, last_activity_at
            FROM sandboxes WHERE tenant_id = ?1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_sandbox(&r)).transpose()
    }

    /// List sandboxes, optionally filtered by status, least recently active first
    pub async fn list(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT id, tenant_id, engine_id, name, status, tier, workspace_path,
                           created_at, last_activity_at
                    FROM sandboxes WHERE status = ?1
                    ORDER BY last_activity_at ASC
                    "#,
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, tenant_id, engine_id, name, status, tier, workspace_path,
                           created_at, last_activity_at
                    FROM sandboxes
                    ORDER BY last_activity_at ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_sandbox).collect()
    }

    pub async fn list_non_destroyed(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, engine_id, name, status, tier, workspace_path,
                   created_at, last_activity_at
            FROM sandboxes WHERE status != 'destroyed'
            ORDER BY last_activity_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_sandbox).collect()
    }

    pub async fn update_status(&self, tenant_id: &str, status: SandboxStatus) -> Result<()> {
        let result = sqlx::query("UPDATE sandboxes SET status = ?1 WHERE tenant_id = ?2")
            .bind(status.as_str())
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    pub async fn update_engine_id(
        &self,
        tenant_id: &str,
        engine_id: &str,
        status: SandboxStatus,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE sandboxes SET engine_id = ?1, status = ?2 WHERE tenant_id = ?3")
                .bind(engine_id)
                .bind(status.as_str())
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Record activity. Never moves the timestamp backwards.
    pub async fn touch(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<()> {
        // Fixed-width UTC timestamps compare lexically
        sqlx::query(
            "UPDATE sandboxes SET last_activity_at = ?1 WHERE tenant_id = ?2 AND last_activity_at < ?1",
        )
        .bind(timestamp(&at))
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete the tenant's row. Returns whether a row existed.
    pub async fn delete(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE tenant_id = ?1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Fixed-width RFC 3339 in UTC, so stored values sort and compare as text.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp { column, value })
}

fn row_to_sandbox(row: &SqliteRow) -> Result<Sandbox> {
    let tier: String = row.get("tier");
    let status: String = row.get("status");
    Ok(Sandbox {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        engine_id: row.get("engine_id"),
        name: row.get("name"),
        status: SandboxStatus::from_str(&status)?,
        tier: tier
            .parse::<ResourceTier>()
            .map_err(|_| StorageError::InvalidTier(tier.clone()))?,
        workspace_path: row.get("workspace_path"),
        created_at: parse_timestamp("created_at", row.get("created_at"))?,
        last_activity_at: parse_timestamp("last_activity_at", row.get("last_activity_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        SandboxStorage::migrate(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    fn sample(tenant: &str) -> Sandbox {
        Sandbox::new(
            tenant,
            format!("warden-{}", tenant),
            ResourceTier::Standard,
            format!("warden-{}-workspace", tenant),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let storage = SandboxStorage::new(setup_test_db().await);
        let mut sandbox = sample("alice");
        sandbox.engine_id = Some("engine-1".to_string());
        sandbox.status = SandboxStatus::Running;

        storage.upsert(&sandbox).await.unwrap();

        let loaded = storage.get_by_tenant("alice").await.unwrap().unwrap();
        assert_eq!(loaded.id, sandbox.id);
        assert_eq!(loaded.engine_id.as_deref(), Some("engine-1"));
        assert_eq!(loaded.status, SandboxStatus::Running);
        assert_eq!(loaded.tier, ResourceTier::Standard);
        assert!(storage.get_by_tenant("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_row_per_tenant() {
        let storage = SandboxStorage::new(setup_test_db().await);
        storage.upsert(&sample("alice")).await.unwrap();

        let replacement = sample("alice");
        storage.upsert(&replacement).await.unwrap();

        let all = storage.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, replacement.id);
    }

    #[tokio::test]
    async fn test_status_and_engine_updates() {
        let storage = SandboxStorage::new(setup_test_db().await);
        storage.upsert(&sample("alice")).await.unwrap();

        storage
            .update_engine_id("alice", "engine-2", SandboxStatus::Running)
            .await
            .unwrap();
        storage
            .update_status("alice", SandboxStatus::Stopped)
            .await
            .unwrap();

        let loaded = storage.get_by_tenant("alice").await.unwrap().unwrap();
        assert_eq!(loaded.engine_id.as_deref(), Some("engine-2"));
        assert_eq!(loaded.status, SandboxStatus::Stopped);

        let err = storage
            .update_status("nobody", SandboxStatus::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_touch_only_moves_forward() {
        let storage = SandboxStorage::new(setup_test_db().await);
        let sandbox = sample("alice");
        storage.upsert(&sandbox).await.unwrap();

        let later = sandbox.last_activity_at + Duration::minutes(5);
        storage.touch("alice", later).await.unwrap();
        storage
            .touch("alice", sandbox.last_activity_at - Duration::hours(1))
            .await
            .unwrap();

        let loaded = storage.get_by_tenant("alice").await.unwrap().unwrap();
        assert_eq!(loaded.last_activity_at.timestamp(), later.timestamp());
    }

    #[tokio::test]
    async fn test_list_filters_and_delete() {
        let storage = SandboxStorage::new(setup_test_db().await);
        storage.upsert(&sample("alice")).await.unwrap();
        storage.upsert(&sample("bob")).await.unwrap();
        storage
            .update_status("bob", SandboxStatus::Destroyed)
            .await
            .unwrap();

        assert_eq!(storage.list_non_destroyed().await.unwrap().len(), 1);
        assert_eq!(
            storage
                .list(Some(SandboxStatus::Destroyed))
                .await
                .unwrap()
                .len(),
            1
        );

        assert!(storage.delete("alice").await.unwrap());
        assert!(!storage.delete("alice").await.unwrap());
        assert!(storage.get_by_tenant("alice").await.unwrap().is_none());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SandboxStatus::Creating,
            SandboxStatus::Running,
            SandboxStatus::Stopped,
            SandboxStatus::Destroyed,
        ] {
            assert_eq!(SandboxStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SandboxStatus::from_str("paused").is_err());
    }
}
