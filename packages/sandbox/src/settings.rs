// ABOUTME: Scoped key/value settings repository backed by SQLite
// ABOUTME: Holds per-tenant overrides such as the adapter mode

use crate::storage::{timestamp, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Setting key holding a tenant's adapter mode
pub const ADAPTER_MODE_KEY: &str = "adapter_mode";

/// Settings scope for one tenant
pub fn tenant_scope(tenant_id: &str) -> String {
    format!("tenant:{}", tenant_id)
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, scope: &str, key: &str) -> Result<bool>;

    /// All key/value pairs in a scope, sorted by key
    async fn list_scope(&self, scope: &str) -> Result<Vec<(String, String)>>;
}

pub struct SqliteSettingsRepository {
    pool: SqlitePool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE scope = ?1 AND key = ?2")
            .bind(scope)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        debug!("Setting {}/{} = {}", scope, key, value);
        sqlx::query(
            r#"
            INSERT INTO settings (scope, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE scope = ?1 AND key = ?2")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_scope(&self, scope: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM settings WHERE scope = ?1 ORDER BY key")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }
}
