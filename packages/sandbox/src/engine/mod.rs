// ABOUTME: Container engine trait used by the sandbox manager for lifecycle, exec and stats
// ABOUTME: Docker is the production implementation; an in-process engine backs the test suites

use crate::demux::{DemuxError, StreamFrame};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod local;

pub use docker::DockerEngine;
#[cfg(any(test, feature = "test-utils"))]
pub use local::LocalProcessEngine;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Name conflict: {0}")]
    Conflict(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Output stream error: {0}")]
    Stream(String),

    #[error("Malformed exec stream: {0}")]
    Protocol(#[from] DemuxError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Frames of one exec, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame>> + Send>>;

/// Everything the engine needs to create a tenant container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub workspace_path: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn from_engine(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Command to run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    /// Run a script with `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            command: vec!["sh".to_string(), "-c".to_string(), script.into()],
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// A started exec. The output stream is live; dropping it releases the transport.
pub struct ExecHandle {
    pub exec_id: String,
    pub output: FrameStream,
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_usage_percent: f64,
    pub memory_usage_mb: u64,
    pub memory_limit_mb: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl ResourceStats {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_limit_mb > 0 {
            (self.memory_usage_mb as f64 / self.memory_limit_mb as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Container engine backing tenant sandboxes
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check if the engine is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Make sure the image is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a container, returning the engine id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container. Stopping an already stopped container succeeds.
    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Look up a container by name or id. `None` when it does not exist.
    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>>;

    /// Create a named volume. Creating an existing volume succeeds.
    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<()>;

    /// Remove a named volume. Removing a missing volume succeeds.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Start a command and return its live output before it completes
    async fn exec(&self, container_id: &str, spec: ExecSpec) -> Result<ExecHandle>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState>;

    /// One-shot resource usage snapshot
    async fn stats(&self, container_id: &str) -> Result<ResourceStats>;
}
