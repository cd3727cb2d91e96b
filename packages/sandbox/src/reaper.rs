// ABOUTME: Idle reaper that stops and destroys sandboxes unused past configured thresholds
// ABOUTME: Background sweep on its own cadence, sharing the manager's per-tenant locks

use crate::error::Result;
use crate::manager::{ReapAction, SandboxManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};
use warden_config::ReaperConfig;

/// Idle thresholds applied to each tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// T1: running sandboxes idle this long are stopped
    pub stop_after: Duration,
    /// T2: sandboxes idle this long are destroyed
    pub destroy_after: Duration,
    pub retain_volume: bool,
}

impl From<&ReaperConfig> for ReapPolicy {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            stop_after: config.idle_stop_after,
            destroy_after: config.idle_destroy_after,
            retain_volume: config.retain_volume,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    pub stopped: Vec<String>,
    pub destroyed: Vec<String>,
    /// Tenants with lifecycle work in flight, left for the next sweep
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
            && self.destroyed.is_empty()
            && self.skipped.is_empty()
            && self.failed.is_empty()
    }
}

pub struct IdleReaper {
    manager: SandboxManager,
    policy: ReapPolicy,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl IdleReaper {
    pub fn new(manager: SandboxManager, config: &ReaperConfig) -> Self {
        Self {
            manager,
            policy: ReapPolicy::from(config),
            interval: config.interval,
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// One pass over every non-destroyed sandbox
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        sweep(&self.manager, &self.policy, now).await
    }

    /// Start the background sweep task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let manager = self.manager.clone();
        let policy = self.policy;
        let interval = self.interval;
        let running_flag = self.running.clone();
        let wake = self.wake.clone();

        tokio::spawn(async move {
            info!(
                "Idle reaper started (stop after {}s, destroy after {}s, every {}s)",
                policy.stop_after.as_secs(),
                policy.destroy_after.as_secs(),
                interval.as_secs()
            );

            loop {
                if !*running_flag.read().await {
                    info!("Idle reaper stopped");
                    break;
                }

                match sweep(&manager, &policy, Utc::now()).await {
                    Ok(report) if !report.is_empty() => info!(
                        "Reaper sweep: {} stopped, {} destroyed, {} skipped, {} failed",
                        report.stopped.len(),
                        report.destroyed.len(),
                        report.skipped.len(),
                        report.failed.len()
                    ),
                    Ok(_) => debug!("Reaper sweep found nothing idle"),
                    Err(e) => error!("Reaper sweep failed: {}", e),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake.notified() => {}
                }
            }
        });
    }

    /// Stop the background task after its current sweep
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_waiters();
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn sweep(
    manager: &SandboxManager,
    policy: &ReapPolicy,
    now: DateTime<Utc>,
) -> Result<ReapReport> {
    let candidates = manager.registry().list_non_destroyed().await?;
    let mut report = ReapReport::default();

    for sandbox in candidates {
        let tenant = sandbox.tenant_id;
        match manager.reap_if_idle(&tenant, policy, now).await {
            Ok(ReapAction::Stopped) => report.stopped.push(tenant),
            Ok(ReapAction::Destroyed) => report.destroyed.push(tenant),
            Ok(ReapAction::Skipped) => report.skipped.push(tenant),
            Ok(ReapAction::None) => {}
            Err(e) => {
                warn!("Failed to reap sandbox for tenant {}: {}", tenant, e);
                report.failed.push(tenant);
            }
        }
    }

    let pruned = manager.registry().prune_locks();
    if pruned > 0 {
        debug!("Pruned {} idle tenant locks", pruned);
    }
    Ok(report)
}
