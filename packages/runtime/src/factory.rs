// ABOUTME: Builds a tenant's capability set for its resolved adapter mode
// ABOUTME: Execution engines are cached per tenant and mode so abort reaches runs started earlier

use crate::error::CapabilityError;
use crate::execution::{ExecutionEngine, NativeExecutionEngine, SandboxedExecutionEngine};
use crate::files::{FileOperations, NativeFileOperations, SandboxedFileOperations};
use crate::mode::ModeResolver;
use crate::sessions::{NativeSessionDiscovery, SandboxedSessionDiscovery, SessionDiscovery};
use crate::shell::SandboxShell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;
use warden_config::{AdapterMode, WardenConfig};
use warden_sandbox::{sandbox_name, CreateOptions, SandboxError, SandboxManager, WaitPolicy};

/// Everything upper layers need to serve one tenant
#[derive(Clone)]
pub struct Capabilities {
    pub tenant_id: String,
    pub mode: AdapterMode,
    pub execution: Arc<dyn ExecutionEngine>,
    pub files: Arc<dyn FileOperations>,
    pub sessions: Arc<dyn SessionDiscovery>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("tenant_id", &self.tenant_id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub struct CapabilityFactory {
    manager: SandboxManager,
    modes: Arc<ModeResolver>,
    config: Arc<WardenConfig>,
    executions: Mutex<HashMap<(String, AdapterMode), Arc<dyn ExecutionEngine>>>,
}

impl CapabilityFactory {
    pub fn new(manager: SandboxManager, modes: Arc<ModeResolver>, config: WardenConfig) -> Self {
        Self {
            manager,
            modes,
            config: Arc::new(config),
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    pub fn modes(&self) -> &Arc<ModeResolver> {
        &self.modes
    }

    /// Host directory backing a tenant's native workspace
    pub fn native_workspace(&self, tenant_id: &str) -> PathBuf {
        self.config
            .paths
            .native_workspace_root
            .join(sandbox_name(tenant_id))
    }

    /// Resolve the tenant's mode and hand out the matching adapters.
    ///
    /// In sandboxed mode this starts sandbox creation without waiting; the adapters
    /// report not-ready until it is running.
    pub async fn for_tenant(&self, tenant_id: &str) -> Result<Capabilities, CapabilityError> {
        if tenant_id.trim().is_empty() {
            return Err(SandboxError::InvalidTenant(tenant_id.to_string()).into());
        }
        let mode = self.modes.resolve(tenant_id).await?;
        debug!("Tenant {} resolved to {} adapters", tenant_id, mode);

        match mode {
            AdapterMode::Native => self.native(tenant_id).await,
            AdapterMode::Sandboxed => self.sandboxed(tenant_id).await,
        }
    }

    fn cached_execution(
        &self,
        tenant_id: &str,
        mode: AdapterMode,
        build: impl FnOnce() -> Arc<dyn ExecutionEngine>,
    ) -> Arc<dyn ExecutionEngine> {
        let mut cache = self.executions.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .entry((tenant_id.to_string(), mode))
            .or_insert_with(build)
            .clone()
    }

    async fn native(&self, tenant_id: &str) -> Result<Capabilities, CapabilityError> {
        let workspace = self.native_workspace(tenant_id);
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            CapabilityError::Workspace(format!("{}: {}", workspace.display(), e))
        })?;

        let timeouts = self.config.timeouts;
        let execution = self.cached_execution(tenant_id, AdapterMode::Native, || {
            Arc::new(NativeExecutionEngine::new(workspace.clone(), timeouts.exec))
                as Arc<dyn ExecutionEngine>
        });

        Ok(Capabilities {
            tenant_id: tenant_id.to_string(),
            mode: AdapterMode::Native,
            execution,
            files: Arc::new(NativeFileOperations::new(
                workspace,
                timeouts,
                self.config.limits,
            )),
            sessions: Arc::new(NativeSessionDiscovery::new(
                self.config.paths.native_sessions_root.clone(),
            )),
        })
    }

    async fn sandboxed(&self, tenant_id: &str) -> Result<Capabilities, CapabilityError> {
        match self
            .manager
            .get_or_create(tenant_id, CreateOptions::default(), WaitPolicy::no_wait())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_ready() => {
                debug!("Sandbox for tenant {} still starting", tenant_id);
            }
            Err(e) => return Err(e.into()),
        }

        let shell = SandboxShell::new(self.manager.clone(), tenant_id);
        let root = self.manager.config().container_workspace.clone();
        let timeouts = self.config.timeouts;

        let execution = self.cached_execution(tenant_id, AdapterMode::Sandboxed, || {
            Arc::new(SandboxedExecutionEngine::new(
                shell.clone(),
                root.clone(),
                timeouts.exec,
            )) as Arc<dyn ExecutionEngine>
        });

        Ok(Capabilities {
            tenant_id: tenant_id.to_string(),
            mode: AdapterMode::Sandboxed,
            execution,
            files: Arc::new(SandboxedFileOperations::new(
                shell.clone(),
                root,
                timeouts,
                self.config.limits,
            )),
            sessions: Arc::new(SandboxedSessionDiscovery::new(
                shell,
                self.config.paths.sandbox_sessions_root.clone(),
                timeouts,
            )),
        })
    }
}
