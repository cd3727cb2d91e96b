// ABOUTME: Stats monitor polling resource usage of running sandboxes on its own interval
// ABOUTME: Keeps a bounded snapshot history per tenant for capacity decisions

use crate::engine::ResourceStats;
use crate::manager::SandboxManager;
use crate::storage::{Sandbox, SandboxStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time;
use tracing::{error, info, warn};

const MAX_SNAPSHOTS: usize = 1000;
const DRAIN_SNAPSHOTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub memory_usage_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl ResourceSnapshot {
    pub fn new(tenant_id: &str, stats: &ResourceStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            timestamp,
            cpu_usage_percent: stats.cpu_usage_percent,
            memory_usage_mb: stats.memory_usage_mb,
            memory_limit_mb: stats.memory_limit_mb,
            memory_usage_percent: stats.memory_usage_percent(),
            network_rx_bytes: stats.network_rx_bytes,
            network_tx_bytes: stats.network_tx_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedMetrics {
    pub tenant_id: String,
    pub window_minutes: u32,
    pub avg_cpu_percent: f64,
    pub avg_memory_mb: u64,
    pub peak_cpu_percent: f64,
    pub peak_memory_mb: u64,
    pub snapshots_count: usize,
}

type SnapshotMap = Arc<RwLock<HashMap<String, Vec<ResourceSnapshot>>>>;

/// Resource monitor for tenant sandboxes
pub struct StatsMonitor {
    manager: SandboxManager,
    interval: Duration,
    snapshots: SnapshotMap,
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl StatsMonitor {
    pub fn new(manager: SandboxManager, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Start the polling task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let manager = self.manager.clone();
        let snapshots = self.snapshots.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;
        let wake = self.wake.clone();

        tokio::spawn(async move {
            info!("Stats monitor started (every {}s)", interval.as_secs());

            loop {
                if !*running_flag.read().await {
                    info!("Stats monitor stopped");
                    break;
                }

                if let Err(e) = poll_once(&manager, &snapshots).await {
                    error!("Failed to list sandboxes for stats: {}", e);
                }

                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = wake.notified() => {}
                }
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_waiters();
    }

    /// Poll every running sandbox once
    pub async fn poll(&self) -> crate::error::Result<()> {
        poll_once(&self.manager, &self.snapshots).await
    }

    /// Most recent snapshots for a tenant, oldest first
    pub async fn snapshots(&self, tenant_id: &str, limit: Option<usize>) -> Vec<ResourceSnapshot> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(tenant_id) {
            Some(history) => {
                let start = limit
                    .map(|limit| history.len().saturating_sub(limit))
                    .unwrap_or(0);
                history[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub async fn aggregated(&self, tenant_id: &str, window_minutes: u32) -> Option<AggregatedMetrics> {
        let snapshots = self.snapshots.read().await;
        let window_start = Utc::now() - chrono::Duration::minutes(window_minutes as i64);
        let recent: Vec<_> = snapshots
            .get(tenant_id)?
            .iter()
            .filter(|s| s.timestamp >= window_start)
            .collect();
        if recent.is_empty() {
            return None;
        }

        let count = recent.len();
        let sum_cpu: f64 = recent.iter().map(|s| s.cpu_usage_percent).sum();
        let sum_memory: u64 = recent.iter().map(|s| s.memory_usage_mb).sum();

        Some(AggregatedMetrics {
            tenant_id: tenant_id.to_string(),
            window_minutes,
            avg_cpu_percent: sum_cpu / count as f64,
            avg_memory_mb: sum_memory / count as u64,
            peak_cpu_percent: recent
                .iter()
                .map(|s| s.cpu_usage_percent)
                .fold(0.0, f64::max),
            peak_memory_mb: recent.iter().map(|s| s.memory_usage_mb).max().unwrap_or(0),
            snapshots_count: count,
        })
    }

    /// Tenants whose latest memory or CPU reading is at or above `threshold_percent`
    pub async fn over_limit(&self, threshold_percent: f64) -> Vec<(String, String)> {
        let snapshots = self.snapshots.read().await;
        let mut violations = Vec::new();

        for (tenant_id, history) in snapshots.iter() {
            let Some(latest) = history.last() else {
                continue;
            };
            if latest.memory_usage_percent >= threshold_percent {
                violations.push((
                    tenant_id.clone(),
                    format!("Memory usage at {:.1}%", latest.memory_usage_percent),
                ));
            }
            if latest.cpu_usage_percent >= threshold_percent {
                violations.push((
                    tenant_id.clone(),
                    format!("CPU usage at {:.1}%", latest.cpu_usage_percent),
                ));
            }
        }

        violations.sort();
        violations
    }
}

async fn poll_once(manager: &SandboxManager, snapshots: &SnapshotMap) -> crate::error::Result<()> {
    let sandboxes = manager
        .registry()
        .list(Some(SandboxStatus::Running))
        .await?;

    // Drop history for sandboxes that are gone or stopped
    let running: HashSet<&str> = sandboxes.iter().map(|s| s.tenant_id.as_str()).collect();
    snapshots
        .write()
        .await
        .retain(|tenant, _| running.contains(tenant.as_str()));

    for sandbox in &sandboxes {
        if let Err(e) = record(manager, snapshots, sandbox).await {
            warn!("Failed to poll stats for tenant {}: {}", sandbox.tenant_id, e);
        }
    }
    Ok(())
}

async fn record(
    manager: &SandboxManager,
    snapshots: &SnapshotMap,
    sandbox: &Sandbox,
) -> crate::error::Result<()> {
    let stats = manager.stats(&sandbox.tenant_id).await?;
    let snapshot = ResourceSnapshot::new(&sandbox.tenant_id, &stats, Utc::now());

    let mut map = snapshots.write().await;
    let history = map.entry(sandbox.tenant_id.clone()).or_default();
    history.push(snapshot);
    if history.len() > MAX_SNAPSHOTS {
        history.drain(0..DRAIN_SNAPSHOTS);
    }
    Ok(())
}
