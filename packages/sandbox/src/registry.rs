// ABOUTME: Sandbox registry: in-memory cache over persisted sandbox rows plus per-tenant lifecycle locks
// ABOUTME: Also derives the deterministic container and volume names for a tenant

use crate::storage::{Result, Sandbox, SandboxStatus, SandboxStorage};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::debug;

const NAME_PREFIX: &str = "warden";
const MAX_SLUG_LEN: usize = 32;

/// Container name for a tenant. Pure function of the tenant id.
pub fn sandbox_name(tenant_id: &str) -> String {
    let mut slug = String::with_capacity(tenant_id.len());
    let mut last_dash = true;
    for c in tenant_id.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('-');

    let digest = Sha256::digest(tenant_id.as_bytes());
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();

    if slug.is_empty() {
        format!("{}-{}", NAME_PREFIX, hash)
    } else {
        format!("{}-{}-{}", NAME_PREFIX, slug, hash)
    }
}

/// Volume holding a sandbox's workspace.
pub fn volume_name(sandbox_name: &str) -> String {
    format!("{}-workspace", sandbox_name)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    sandbox: Sandbox,
    /// When the engine last confirmed the container was running
    verified_at: Option<Instant>,
}

pub struct SandboxRegistry {
    storage: Arc<SandboxStorage>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SandboxRegistry {
    pub fn new(storage: Arc<SandboxStorage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<SandboxStorage> {
        &self.storage
    }

    /// Cached record, falling back to the store and populating the cache
    pub async fn get(&self, tenant_id: &str) -> Result<Option<Sandbox>> {
        if let Some(entry) = self.cache.read().await.get(tenant_id) {
            return Ok(Some(entry.sandbox.clone()));
        }

        let loaded = self.storage.get_by_tenant(tenant_id).await?;
        if let Some(sandbox) = &loaded {
            debug!("Registry loaded {} from store", tenant_id);
            self.cache.write().await.insert(
                tenant_id.to_string(),
                CacheEntry {
                    sandbox: sandbox.clone(),
                    verified_at: None,
                },
            );
        }
        Ok(loaded)
    }

    /// Cached running sandbox the engine confirmed within `ttl`
    pub async fn fresh_running(&self, tenant_id: &str, ttl: Duration) -> Option<Sandbox> {
        let cache = self.cache.read().await;
        let entry = cache.get(tenant_id)?;
        let fresh = entry
            .verified_at
            .map(|at| at.elapsed() <= ttl)
            .unwrap_or(false);
        (entry.sandbox.status == SandboxStatus::Running && fresh).then(|| entry.sandbox.clone())
    }

    /// Persist and cache a record. `verified` marks it as just confirmed by the engine.
    pub async fn put(&self, sandbox: &Sandbox, verified: bool) -> Result<()> {
        self.storage.upsert(sandbox).await?;
        self.cache.write().await.insert(
            sandbox.tenant_id.clone(),
            CacheEntry {
                sandbox: sandbox.clone(),
                verified_at: verified.then(Instant::now),
            },
        );
        Ok(())
    }

    pub async fn set_status(&self, tenant_id: &str, status: SandboxStatus) -> Result<()> {
        self.storage.update_status(tenant_id, status).await?;
        if let Some(entry) = self.cache.write().await.get_mut(tenant_id) {
            entry.sandbox.status = status;
            entry.verified_at = None;
        }
        Ok(())
    }

    /// Record the engine container backing a tenant, as just confirmed by the engine
    pub async fn set_engine_id(
        &self,
        tenant_id: &str,
        engine_id: &str,
        status: SandboxStatus,
    ) -> Result<()> {
        self.storage
            .update_engine_id(tenant_id, engine_id, status)
            .await?;
        if let Some(entry) = self.cache.write().await.get_mut(tenant_id) {
            entry.sandbox.engine_id = Some(engine_id.to_string());
            entry.sandbox.status = status;
            entry.verified_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Drop the engine confirmation so the next lookup re-verifies
    pub async fn mark_unverified(&self, tenant_id: &str) {
        if let Some(entry) = self.cache.write().await.get_mut(tenant_id) {
            entry.verified_at = None;
        }
    }

    /// Record activity in the cache immediately and in the store
    pub async fn touch(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(entry) = self.cache.write().await.get_mut(tenant_id) {
            if entry.sandbox.last_activity_at < at {
                entry.sandbox.last_activity_at = at;
            }
        }
        self.storage.touch(tenant_id, at).await
    }

    /// Delete the row and forget the cache entry. Returns whether a row existed.
    pub async fn remove(&self, tenant_id: &str) -> Result<bool> {
        let existed = self.storage.delete(tenant_id).await?;
        self.invalidate(tenant_id).await;
        Ok(existed)
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }

    pub async fn list(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        self.storage.list(status).await
    }

    /// Non-destroyed sandboxes with cached activity overlaid on stored rows
    pub async fn list_non_destroyed(&self) -> Result<Vec<Sandbox>> {
        let mut rows = self.storage.list_non_destroyed().await?;
        let cache = self.cache.read().await;
        for row in rows.iter_mut() {
            if let Some(entry) = cache.get(&row.tenant_id) {
                if entry.sandbox.last_activity_at > row.last_activity_at {
                    row.last_activity_at = entry.sandbox.last_activity_at;
                }
            }
        }
        Ok(rows)
    }

    /// The lifecycle mutex for a tenant
    pub fn lock_for(&self, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the tenant's lifecycle lock
    pub async fn lock(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(tenant_id).lock_owned().await
    }

    /// Take the tenant's lifecycle lock only if nobody holds it
    pub fn try_lock(&self, tenant_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(tenant_id).try_lock_owned().ok()
    }

    pub fn is_locked(&self, tenant_id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .get(tenant_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop lock entries nobody is holding or waiting on
    pub fn prune_locks(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let before = locks.len();
        locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - locks.len()
    }
}
