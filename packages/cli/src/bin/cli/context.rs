// ABOUTME: Wires configuration, the database, the Docker engine and the capability factory together
// ABOUTME: Every CLI command starts from one Context built from the environment

use anyhow::{Context as _, Result};
use std::sync::Arc;
use tracing::debug;
use warden_config::WardenConfig;
use warden_runtime::{CapabilityFactory, ModeResolver};
use warden_sandbox::{
    connect_database, DockerEngine, SandboxManager, SandboxRegistry, SandboxStorage,
    SqliteSettingsRepository,
};

pub struct Context {
    pub config: WardenConfig,
    pub manager: SandboxManager,
    pub factory: CapabilityFactory,
}

impl Context {
    pub async fn load() -> Result<Self> {
        let config = WardenConfig::from_env().context("Invalid Warden configuration")?;

        // Default database location lives under ~/.warden
        if let Some(home) = dirs::home_dir() {
            std::fs::create_dir_all(home.join(".warden"))
                .context("Failed to create ~/.warden")?;
        }

        let pool = connect_database(&config.database_url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;
        debug!("Connected to {}", config.database_url);

        let engine = DockerEngine::connect().context("Failed to connect to Docker")?;
        let registry = Arc::new(SandboxRegistry::new(Arc::new(SandboxStorage::new(
            pool.clone(),
        ))));
        let manager = SandboxManager::new(Arc::new(engine), registry, config.sandbox.clone());

        let modes = Arc::new(ModeResolver::new(
            Arc::new(SqliteSettingsRepository::new(pool)),
            config.default_adapter_mode,
        ));
        let factory = CapabilityFactory::new(manager.clone(), modes, config.clone());

        Ok(Self {
            config,
            manager,
            factory,
        })
    }
}
