// ABOUTME: Per-tenant adapter mode resolution with a settings override and a global default
// ABOUTME: Resolved modes are cached; writes go through to the settings repository first

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use warden_config::AdapterMode;
use warden_sandbox::{tenant_scope, SettingsRepository, StorageError, ADAPTER_MODE_KEY};

pub struct ModeResolver {
    settings: Arc<dyn SettingsRepository>,
    default_mode: AdapterMode,
    cache: RwLock<HashMap<String, AdapterMode>>,
}

impl ModeResolver {
    pub fn new(settings: Arc<dyn SettingsRepository>, default_mode: AdapterMode) -> Self {
        Self {
            settings,
            default_mode,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_mode(&self) -> AdapterMode {
        self.default_mode
    }

    /// Mode for a tenant: its stored override, else the global default.
    ///
    /// An unparseable stored value falls back to the default with a warning.
    pub async fn resolve(&self, tenant_id: &str) -> Result<AdapterMode, StorageError> {
        if let Some(mode) = self.cache.read().await.get(tenant_id) {
            return Ok(*mode);
        }

        let stored = self
            .settings
            .get(&tenant_scope(tenant_id), ADAPTER_MODE_KEY)
            .await?;
        let mode = match stored {
            Some(raw) => raw.parse::<AdapterMode>().unwrap_or_else(|_| {
                warn!(
                    "Ignoring invalid adapter mode {:?} for tenant {}, using {}",
                    raw, tenant_id, self.default_mode
                );
                self.default_mode
            }),
            None => self.default_mode,
        };

        self.cache.write().await.insert(tenant_id.to_string(), mode);
        Ok(mode)
    }

    /// Store an override for a tenant
    pub async fn set(&self, tenant_id: &str, mode: AdapterMode) -> Result<(), StorageError> {
        self.settings
            .set(&tenant_scope(tenant_id), ADAPTER_MODE_KEY, mode.as_str())
            .await?;
        self.cache.write().await.insert(tenant_id.to_string(), mode);
        info!("Adapter mode for tenant {} set to {}", tenant_id, mode);
        Ok(())
    }

    /// Drop a tenant's override so it follows the default again
    pub async fn clear(&self, tenant_id: &str) -> Result<bool, StorageError> {
        let existed = self
            .settings
            .delete(&tenant_scope(tenant_id), ADAPTER_MODE_KEY)
            .await?;
        self.invalidate(tenant_id).await;
        Ok(existed)
    }

    /// Forget the cached mode, e.g. after the settings were changed elsewhere
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }
}
