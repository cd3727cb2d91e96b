// ABOUTME: Sandbox lifecycle manager: get-or-create with single-flight, exec, stats, stop, start and destroy
// ABOUTME: The only component that talks to the container engine; lifecycle work is serialized per tenant

use crate::demux::Channel;
use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerState, EngineError, ExecHandle, ExecSpec,
    ResourceStats,
};
use crate::error::{Result, SandboxError};
use crate::reaper::ReapPolicy;
use crate::registry::{sandbox_name, volume_name, SandboxRegistry};
use crate::single_flight::SingleFlight;
use crate::storage::{Sandbox, SandboxStatus};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_config::{ResourceTier, SandboxConfig};

pub const LABEL_MANAGED: &str = "warden.managed";
pub const LABEL_TENANT: &str = "warden.tenant";

const MAX_TENANT_ID_LEN: usize = 256;
const EXIT_POLL_ATTEMPTS: usize = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type FlightResult = std::result::Result<Sandbox, Arc<SandboxError>>;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Resource class for a new sandbox. Existing sandboxes keep theirs.
    pub tier: Option<ResourceTier>,
    pub env_vars: HashMap<String, String>,
}

/// How long a `get_or_create` caller is willing to wait for creation.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub wait: bool,
    pub timeout: Duration,
}

impl WaitPolicy {
    pub fn wait(timeout: Duration) -> Self {
        Self {
            wait: true,
            timeout,
        }
    }

    /// Kick off creation and return immediately.
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            timeout: Duration::ZERO,
        }
    }
}

/// What `get_or_create` hands back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub id: String,
    pub tenant_id: String,
    pub engine_id: Option<String>,
    pub name: String,
    pub status: SandboxStatus,
}

impl From<&Sandbox> for SandboxDescriptor {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            id: sandbox.id.clone(),
            tenant_id: sandbox.tenant_id.clone(),
            engine_id: sandbox.engine_id.clone(),
            name: sandbox.name.clone(),
            status: sandbox.status,
        }
    }
}

/// Fully collected output of one exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Outcome of one reaper visit to a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapAction {
    None,
    Stopped,
    Destroyed,
    /// Lifecycle work was in flight for the tenant
    Skipped,
}

/// Sandbox lifecycle manager
#[derive(Clone)]
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<SandboxRegistry>,
    flights: Arc<SingleFlight<FlightResult>>,
    config: Arc<SandboxConfig>,
}

impl SandboxManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<SandboxRegistry>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            flights: Arc::new(SingleFlight::new()),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Return the tenant's running sandbox, creating or starting it as needed.
    ///
    /// Concurrent callers for one tenant share a single creation. When it does not
    /// finish within the wait policy the call fails with `NotReady` while creation
    /// keeps going in the background.
    pub async fn get_or_create(
        &self,
        tenant_id: &str,
        opts: CreateOptions,
        wait: WaitPolicy,
    ) -> Result<SandboxDescriptor> {
        validate_tenant(tenant_id)?;

        if let Some(sandbox) = self
            .registry
            .fresh_running(tenant_id, self.config.health_ttl)
            .await
        {
            self.record_activity(tenant_id).await;
            return Ok(SandboxDescriptor::from(&sandbox));
        }

        let manager = self.clone();
        let tenant = tenant_id.to_string();
        let (flight, started) = self.flights.join_or_start(tenant_id, move |generation| {
            let task_tenant = tenant.clone();
            let handle = tokio::spawn(async move {
                let result = manager
                    .ensure_running(&task_tenant, opts)
                    .await
                    .map_err(Arc::new);
                manager.flights.complete(&task_tenant, generation);
                result
            });
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Arc::new(SandboxError::CreateFailed {
                        tenant_id: tenant,
                        reason: format!("creation task ended abnormally: {}", e),
                    })),
                }
            }
            .boxed()
        });
        if started {
            debug!("Started sandbox creation flight for tenant {}", tenant_id);
        } else {
            debug!("Joined in-flight sandbox creation for tenant {}", tenant_id);
        }

        let outcome = if wait.wait {
            match tokio::time::timeout(wait.timeout, flight).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(
                        "Sandbox for tenant {} not ready after {:?}",
                        tenant_id, wait.timeout
                    );
                    return Err(SandboxError::NotReady {
                        tenant_id: tenant_id.to_string(),
                    });
                }
            }
        } else {
            match flight.now_or_never() {
                Some(outcome) => outcome,
                None => {
                    return Err(SandboxError::NotReady {
                        tenant_id: tenant_id.to_string(),
                    })
                }
            }
        };

        match outcome {
            Ok(sandbox) => {
                self.record_activity(tenant_id).await;
                Ok(SandboxDescriptor::from(&sandbox))
            }
            Err(e) => Err(SandboxError::from_shared(tenant_id, &e)),
        }
    }

    /// Explicitly resume a tenant's existing sandbox and wait for it.
    pub async fn start(&self, tenant_id: &str) -> Result<SandboxDescriptor> {
        if self.registry.get(tenant_id).await?.is_none() {
            return Err(SandboxError::NotFound(tenant_id.to_string()));
        }
        self.get_or_create(
            tenant_id,
            CreateOptions::default(),
            WaitPolicy::wait(self.config.create_timeout),
        )
        .await
    }

    /// Bring the tenant's container to running under the tenant lock.
    async fn ensure_running(&self, tenant_id: &str, opts: CreateOptions) -> Result<Sandbox> {
        let _guard = self.registry.lock(tenant_id).await;

        let name = sandbox_name(tenant_id);
        let existing = self.registry.get(tenant_id).await?;
        let info = self
            .engine
            .inspect_container(&name)
            .await
            .map_err(|e| SandboxError::engine(tenant_id, "inspect", e))?;

        let engine_id = match info {
            Some(info) if info.state == ContainerState::Running => {
                if existing.is_none() {
                    info!("Adopting running container {} for tenant {}", name, tenant_id);
                }
                info.id
            }
            Some(info) if info.state == ContainerState::Dead => {
                warn!("Replacing dead container {} for tenant {}", name, tenant_id);
                self.engine
                    .remove_container(&info.id, true)
                    .await
                    .map_err(|e| SandboxError::engine(tenant_id, "remove", e))?;
                return self.create(tenant_id, existing, opts).await;
            }
            Some(info) => {
                info!(
                    "Starting {:?} container {} for tenant {}",
                    info.state, name, tenant_id
                );
                self.engine
                    .start_container(&info.id)
                    .await
                    .map_err(|e| create_failed(tenant_id, "start", e))?;
                info.id
            }
            None => return self.create(tenant_id, existing, opts).await,
        };

        let mut sandbox = existing.unwrap_or_else(|| {
            let tier = opts.tier.unwrap_or(self.config.tier);
            Sandbox::new(tenant_id, name.clone(), tier, volume_name(&name), Utc::now())
        });
        sandbox.engine_id = Some(engine_id);
        sandbox.status = SandboxStatus::Running;
        self.registry.put(&sandbox, true).await?;
        Ok(sandbox)
    }

    /// Create volume and container for a tenant. Caller holds the tenant lock.
    async fn create(
        &self,
        tenant_id: &str,
        existing: Option<Sandbox>,
        opts: CreateOptions,
    ) -> Result<Sandbox> {
        let name = sandbox_name(tenant_id);
        let now = Utc::now();
        let mut sandbox = match existing {
            Some(mut sandbox) => {
                sandbox.engine_id = None;
                sandbox.last_activity_at = now;
                sandbox
            }
            None => {
                let tier = opts.tier.unwrap_or(self.config.tier);
                Sandbox::new(tenant_id, name.clone(), tier, volume_name(&name), now)
            }
        };
        sandbox.status = SandboxStatus::Creating;
        self.registry.put(&sandbox, false).await?;

        info!(
            "Creating sandbox {} for tenant {} (tier {})",
            name, tenant_id, sandbox.tier
        );

        let created = tokio::time::timeout(
            self.config.create_timeout,
            self.create_container(tenant_id, &sandbox, &opts),
        )
        .await;

        let failure = match created {
            Ok(Ok(engine_id)) => {
                self.registry
                    .set_engine_id(tenant_id, &engine_id, SandboxStatus::Running)
                    .await?;
                sandbox.engine_id = Some(engine_id);
                sandbox.status = SandboxStatus::Running;
                info!(
                    "Sandbox {} running for tenant {}",
                    sandbox.id, tenant_id
                );
                return Ok(sandbox);
            }
            Ok(Err(e)) => e,
            Err(_) => SandboxError::CreateFailed {
                tenant_id: tenant_id.to_string(),
                reason: format!(
                    "creation timed out after {:?}",
                    self.config.create_timeout
                ),
            },
        };

        warn!("Sandbox creation failed for tenant {}: {}", tenant_id, failure);
        if let Err(e) = self.registry.remove(tenant_id).await {
            warn!(
                "Failed to clear creating record for tenant {}: {}",
                tenant_id, e
            );
        }
        Err(failure)
    }

    async fn create_container(
        &self,
        tenant_id: &str,
        sandbox: &Sandbox,
        opts: &CreateOptions,
    ) -> Result<String> {
        self.engine
            .ensure_image(&self.config.image)
            .await
            .map_err(|e| create_failed(tenant_id, "pull image", e))?;

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_TENANT.to_string(), tenant_id.to_string()),
        ]);
        self.engine
            .create_volume(&sandbox.workspace_path, labels.clone())
            .await
            .map_err(|e| create_failed(tenant_id, "create volume", e))?;

        let spec = ContainerSpec {
            name: sandbox.name.clone(),
            image: self.config.image.clone(),
            volume: sandbox.workspace_path.clone(),
            workspace_path: self.config.container_workspace.clone(),
            memory_mb: sandbox.tier.memory_mb(),
            cpu_cores: sandbox.tier.cpu_cores(),
            env_vars: opts.env_vars.clone(),
            labels,
        };

        match self.engine.create_container(&spec).await {
            Ok(id) => Ok(id),
            Err(EngineError::Conflict(reason)) => {
                // Someone else created the name between our inspect and create
                debug!(
                    "Name conflict creating {} for tenant {}: {}",
                    spec.name, tenant_id, reason
                );
                let info = self
                    .engine
                    .inspect_container(&spec.name)
                    .await
                    .map_err(|e| create_failed(tenant_id, "inspect", e))?
                    .ok_or_else(|| SandboxError::CreateFailed {
                        tenant_id: tenant_id.to_string(),
                        reason: format!("name conflict on {} but no container found", spec.name),
                    })?;
                if info.state != ContainerState::Running {
                    self.engine
                        .start_container(&info.id)
                        .await
                        .map_err(|e| create_failed(tenant_id, "start", e))?;
                }
                Ok(info.id)
            }
            Err(e) => Err(create_failed(tenant_id, "create container", e)),
        }
    }

    /// Start a command in the tenant's running sandbox.
    ///
    /// Returns as soon as the exec is started; output arrives on the handle's stream.
    /// Never starts a stopped sandbox.
    pub async fn exec(&self, tenant_id: &str, spec: ExecSpec) -> Result<ExecHandle> {
        let sandbox = self.running_sandbox(tenant_id).await?;
        let engine_id = sandbox
            .engine_id
            .as_deref()
            .ok_or_else(|| SandboxError::NotRunning {
                tenant_id: tenant_id.to_string(),
                status: sandbox.status,
            })?;

        self.record_activity(tenant_id).await;
        debug!("Exec in {} for tenant {}: {:?}", sandbox.name, tenant_id, spec.command);

        match self.engine.exec(engine_id, spec).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if matches!(e, EngineError::NotFound(_) | EngineError::Conflict(_)) {
                    // Container went away or stopped underneath us; re-verify on next get_or_create
                    self.registry.mark_unverified(tenant_id).await;
                }
                Err(SandboxError::engine(tenant_id, "exec", e))
            }
        }
    }

    /// Run a command to completion and collect its output.
    ///
    /// On timeout the stream is dropped and `Timeout { operation: "exec" }` returned.
    pub async fn exec_collect(
        &self,
        tenant_id: &str,
        spec: ExecSpec,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let handle = self.exec(tenant_id, spec).await?;
        let exec_id = handle.exec_id;
        let mut output = handle.output;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(frame) = output.next().await {
                let frame = frame.map_err(|e| SandboxError::engine(tenant_id, "exec stream", e))?;
                match frame.channel {
                    Channel::Stdout => stdout.extend_from_slice(&frame.payload),
                    Channel::Stderr => stderr.extend_from_slice(&frame.payload),
                }
            }
            Ok::<_, SandboxError>((stdout, stderr))
        };

        let (stdout, stderr) = tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| SandboxError::Timeout {
                operation: "exec",
                after: timeout,
            })??;

        let exit_code = self.exit_code(tenant_id, &exec_id).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Exit code of a finished exec, polling briefly while the engine catches up.
    pub async fn exit_code(&self, tenant_id: &str, exec_id: &str) -> Result<Option<i64>> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            let state = self
                .engine
                .inspect_exec(exec_id)
                .await
                .map_err(|e| SandboxError::engine(tenant_id, "inspect exec", e))?;
            if !state.running {
                return Ok(state.exit_code);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        debug!("Exec {} still running after stream end", exec_id);
        Ok(None)
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<ResourceStats> {
        let sandbox = self.running_sandbox(tenant_id).await?;
        let engine_id = sandbox.engine_id.as_deref().unwrap_or(&sandbox.name);
        self.engine
            .stats(engine_id)
            .await
            .map_err(|e| SandboxError::engine(tenant_id, "stats", e))
    }

    /// Stop the tenant's sandbox. The workspace volume is kept.
    pub async fn stop(&self, tenant_id: &str) -> Result<()> {
        let _guard = self.registry.lock(tenant_id).await;
        self.stop_locked(tenant_id).await
    }

    async fn stop_locked(&self, tenant_id: &str) -> Result<()> {
        let sandbox = self
            .registry
            .get(tenant_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(tenant_id.to_string()))?;
        if sandbox.status == SandboxStatus::Stopped {
            return Ok(());
        }

        let target = sandbox.engine_id.as_deref().unwrap_or(&sandbox.name);
        match self.engine.stop_container(target, self.config.stop_grace).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(SandboxError::engine(tenant_id, "stop", e)),
        }
        self.registry
            .set_status(tenant_id, SandboxStatus::Stopped)
            .await?;
        info!("Stopped sandbox {} for tenant {}", sandbox.name, tenant_id);
        Ok(())
    }

    /// Remove the container and the persisted record together.
    ///
    /// With `retain_volume` the workspace volume survives for a later sandbox.
    /// Destroying a tenant without a sandbox still removes any orphaned container.
    pub async fn destroy(&self, tenant_id: &str, retain_volume: bool) -> Result<()> {
        let _guard = self.registry.lock(tenant_id).await;
        self.destroy_locked(tenant_id, retain_volume).await
    }

    async fn destroy_locked(&self, tenant_id: &str, retain_volume: bool) -> Result<()> {
        let existing = self.registry.get(tenant_id).await?;
        let name = sandbox_name(tenant_id);
        let (target, volume) = match &existing {
            Some(sandbox) => (
                sandbox.engine_id.clone().unwrap_or_else(|| sandbox.name.clone()),
                sandbox.workspace_path.clone(),
            ),
            None => (name.clone(), volume_name(&name)),
        };

        self.engine
            .remove_container(&target, true)
            .await
            .map_err(|e| SandboxError::engine(tenant_id, "remove", e))?;
        if target != name {
            // A container under the deterministic name would be adopted by the next get_or_create
            self.engine
                .remove_container(&name, true)
                .await
                .map_err(|e| SandboxError::engine(tenant_id, "remove", e))?;
        }

        if !retain_volume {
            self.engine
                .remove_volume(&volume)
                .await
                .map_err(|e| SandboxError::engine(tenant_id, "remove volume", e))?;
        }

        let existed = self.registry.remove(tenant_id).await?;
        info!(
            "Destroyed sandbox {} for tenant {} (volume {}, record existed: {})",
            name,
            tenant_id,
            if retain_volume { "retained" } else { "removed" },
            existed
        );
        Ok(())
    }

    /// All persisted sandboxes
    pub async fn list(&self) -> Result<Vec<Sandbox>> {
        Ok(self.registry.list(None).await?)
    }

    /// Stop or destroy the tenant's sandbox if it has been idle long enough at `now`.
    ///
    /// Never waits for the tenant lock: a held lock means lifecycle work is in
    /// flight and the tenant is skipped.
    pub async fn reap_if_idle(
        &self,
        tenant_id: &str,
        policy: &ReapPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapAction> {
        if self.flights.in_flight(tenant_id) {
            return Ok(ReapAction::Skipped);
        }
        let Some(_guard) = self.registry.try_lock(tenant_id) else {
            return Ok(ReapAction::Skipped);
        };

        // Activity may have moved since the sweep listed this tenant
        let Some(sandbox) = self.registry.get(tenant_id).await? else {
            return Ok(ReapAction::None);
        };
        let idle = (now - sandbox.last_activity_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if idle >= policy.destroy_after {
            info!(
                "Reaping sandbox for tenant {} idle for {}s",
                tenant_id,
                idle.as_secs()
            );
            self.destroy_locked(tenant_id, policy.retain_volume).await?;
            return Ok(ReapAction::Destroyed);
        }

        if idle >= policy.stop_after && sandbox.status == SandboxStatus::Running {
            info!(
                "Stopping sandbox for tenant {} idle for {}s",
                tenant_id,
                idle.as_secs()
            );
            self.stop_locked(tenant_id).await?;
            return Ok(ReapAction::Stopped);
        }

        Ok(ReapAction::None)
    }

    async fn running_sandbox(&self, tenant_id: &str) -> Result<Sandbox> {
        let sandbox = self
            .registry
            .get(tenant_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound(tenant_id.to_string()))?;
        match sandbox.status {
            SandboxStatus::Running => Ok(sandbox),
            SandboxStatus::Creating => Err(SandboxError::NotReady {
                tenant_id: tenant_id.to_string(),
            }),
            status => Err(SandboxError::NotRunning {
                tenant_id: tenant_id.to_string(),
                status,
            }),
        }
    }

    async fn record_activity(&self, tenant_id: &str) {
        if let Err(e) = self.registry.touch(tenant_id, Utc::now()).await {
            warn!("Failed to record activity for tenant {}: {}", tenant_id, e);
        }
    }
}

fn create_failed(tenant_id: &str, operation: &str, e: EngineError) -> SandboxError {
    SandboxError::CreateFailed {
        tenant_id: tenant_id.to_string(),
        reason: format!("{}: {}", operation, e),
    }
}

fn validate_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty()
        || tenant_id.len() > MAX_TENANT_ID_LEN
        || tenant_id.chars().any(char::is_control)
    {
        return Err(SandboxError::InvalidTenant(tenant_id.to_string()));
    }
    Ok(())
}
