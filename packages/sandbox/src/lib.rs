// ABOUTME: Per-tenant sandbox management: engine access, registry, lifecycle, reaping and stats
// ABOUTME: Re-exports the types the capability layer and CLI build on

pub mod demux;
pub mod engine;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod reaper;
pub mod registry;
pub mod settings;
pub mod single_flight;
pub mod storage;

pub use demux::{Channel, DemuxError, StreamDemuxer, StreamFrame};
pub use engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, DockerEngine, EngineError,
    ExecHandle, ExecSpec, ExecState, FrameStream, ResourceStats,
};
#[cfg(any(test, feature = "test-utils"))]
pub use engine::LocalProcessEngine;
pub use error::{Result, SandboxError};
pub use manager::{
    CreateOptions, ExecOutput, ReapAction, SandboxDescriptor, SandboxManager, WaitPolicy,
};
pub use monitor::{AggregatedMetrics, ResourceSnapshot, StatsMonitor};
pub use reaper::{IdleReaper, ReapPolicy, ReapReport};
pub use registry::{sandbox_name, volume_name, SandboxRegistry};
pub use settings::{
    tenant_scope, SettingsRepository, SqliteSettingsRepository, ADAPTER_MODE_KEY,
};
pub use storage::{Sandbox, SandboxStatus, SandboxStorage, StorageError};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open the SQLite database at `url`, creating it if needed, and apply migrations.
pub async fn connect_database(url: &str) -> std::result::Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    SandboxStorage::migrate(&pool).await?;
    Ok(pool)
}
