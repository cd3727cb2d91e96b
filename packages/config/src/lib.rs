// ABOUTME: Warden configuration loaded from environment variables with validated defaults
// ABOUTME: Shared by the sandbox manager, capability adapters and the operator CLI

pub mod constants;

use constants::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {key}: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid boolean for {key}: {value}")]
    InvalidBool { key: &'static str, value: String },
    #[error("Invalid adapter mode: {0}")]
    InvalidAdapterMode(String),
    #[error("Invalid resource tier: {0}")]
    InvalidTier(String),
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("Idle destroy threshold ({destroy_minutes}m) must exceed idle stop threshold ({stop_minutes}m)")]
    ReaperThresholds {
        stop_minutes: u64,
        destroy_minutes: u64,
    },
    #[error("Could not determine home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which capability implementations serve a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    Native,
    Sandboxed,
}

impl AdapterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Sandboxed => "sandboxed",
        }
    }
}

impl fmt::Display for AdapterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "sandboxed" | "sandbox" | "container" => Ok(Self::Sandboxed),
            _ => Err(ConfigError::InvalidAdapterMode(s.to_string())),
        }
    }
}

/// Resource class of a tenant sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Small,
    Standard,
    Large,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Standard => "standard",
            Self::Large => "large",
        }
    }

    pub fn memory_mb(&self) -> u64 {
        match self {
            Self::Small => 512,
            Self::Standard => 2048,
            Self::Large => 8192,
        }
    }

    pub fn cpu_cores(&self) -> f64 {
        match self {
            Self::Small => 0.5,
            Self::Standard => 1.0,
            Self::Large => 4.0,
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "standard" => Ok(Self::Standard),
            "large" => Ok(Self::Large),
            _ => Err(ConfigError::InvalidTier(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub tier: ResourceTier,
    /// Mount point of the tenant volume inside the container
    pub container_workspace: String,
    pub create_timeout: Duration,
    /// How long a cached running sandbox is trusted without asking the engine
    pub health_ttl: Duration,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub idle_stop_after: Duration,
    pub idle_destroy_after: Duration,
    pub interval: Duration,
    pub retain_volume: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct OperationTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub stat: Duration,
    pub tree: Duration,
    pub exec: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            stat: Duration::from_secs(10),
            tree: Duration::from_secs(30),
            exec: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileLimits {
    pub max_read_bytes: u64,
    pub max_write_bytes: u64,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: 10 * 1024 * 1024,
            max_write_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Parent of the per-tenant host workspaces used in native mode
    pub native_workspace_root: PathBuf,
    pub native_sessions_root: PathBuf,
    pub sandbox_sessions_root: String,
}

#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub database_url: String,
    pub default_adapter_mode: AdapterMode,
    pub sandbox: SandboxConfig,
    pub reaper: ReaperConfig,
    pub stats_interval: Duration,
    pub timeouts: OperationTimeouts,
    pub limits: FileLimits,
    pub paths: PathsConfig,
}

impl WardenConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        let warden_home = home.join(".warden");

        let database_url = lookup(WARDEN_DATABASE_URL).unwrap_or_else(|| {
            format!("sqlite://{}?mode=rwc", warden_home.join("warden.db").display())
        });

        let default_adapter_mode = lookup(WARDEN_ADAPTER_MODE)
            .unwrap_or_else(|| "native".to_string())
            .parse::<AdapterMode>()?;

        let sandbox = SandboxConfig {
            image: lookup(WARDEN_SANDBOX_IMAGE).unwrap_or_else(|| "ubuntu:22.04".to_string()),
            tier: lookup(WARDEN_SANDBOX_TIER)
                .unwrap_or_else(|| "standard".to_string())
                .parse::<ResourceTier>()?,
            container_workspace: lookup(WARDEN_CONTAINER_WORKSPACE)
                .unwrap_or_else(|| "/workspace".to_string()),
            create_timeout: seconds(&lookup, WARDEN_CREATE_TIMEOUT_SECONDS, 60)?,
            health_ttl: Duration::from_secs(number(&lookup, WARDEN_HEALTH_TTL_SECONDS, 15)?),
            stop_grace: Duration::from_secs(number(&lookup, WARDEN_STOP_GRACE_SECONDS, 10)?),
        };

        let stop_minutes = number(&lookup, WARDEN_IDLE_STOP_MINUTES, 30)?;
        let destroy_minutes = number(&lookup, WARDEN_IDLE_DESTROY_MINUTES, 24 * 60)?;
        if stop_minutes == 0 {
            return Err(ConfigError::Zero {
                key: WARDEN_IDLE_STOP_MINUTES,
            });
        }
        if destroy_minutes <= stop_minutes {
            return Err(ConfigError::ReaperThresholds {
                stop_minutes,
                destroy_minutes,
            });
        }

        let reaper = ReaperConfig {
            idle_stop_after: Duration::from_secs(stop_minutes * 60),
            idle_destroy_after: Duration::from_secs(destroy_minutes * 60),
            interval: seconds(&lookup, WARDEN_REAPER_INTERVAL_SECONDS, 60)?,
            retain_volume: boolean(&lookup, WARDEN_RETAIN_VOLUME_ON_REAP, true)?,
        };

        let timeouts = OperationTimeouts {
            read: seconds(&lookup, WARDEN_TIMEOUT_READ_SECONDS, 30)?,
            write: seconds(&lookup, WARDEN_TIMEOUT_WRITE_SECONDS, 30)?,
            stat: seconds(&lookup, WARDEN_TIMEOUT_STAT_SECONDS, 10)?,
            tree: seconds(&lookup, WARDEN_TIMEOUT_TREE_SECONDS, 30)?,
            exec: seconds(&lookup, WARDEN_TIMEOUT_EXEC_SECONDS, 600)?,
        };

        let limits = FileLimits {
            max_read_bytes: nonzero(&lookup, WARDEN_MAX_READ_BYTES, 10 * 1024 * 1024)?,
            max_write_bytes: nonzero(&lookup, WARDEN_MAX_WRITE_BYTES, 10 * 1024 * 1024)?,
        };

        let paths = PathsConfig {
            native_workspace_root: lookup(WARDEN_NATIVE_WORKSPACE_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| warden_home.join("workspaces")),
            native_sessions_root: lookup(WARDEN_NATIVE_SESSIONS_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(".claude").join("projects")),
            sandbox_sessions_root: lookup(WARDEN_SANDBOX_SESSIONS_ROOT)
                .unwrap_or_else(|| "/root/.claude/projects".to_string()),
        };

        Ok(Self {
            database_url,
            default_adapter_mode,
            sandbox,
            reaper,
            stats_interval: seconds(&lookup, WARDEN_STATS_INTERVAL_SECONDS, 30)?,
            timeouts,
            limits,
            paths,
        })
    }
}

fn number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

fn nonzero<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = number(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Zero { key });
    }
    Ok(value)
}

fn seconds<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    nonzero(lookup, key, default).map(Duration::from_secs)
}

fn boolean<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value: raw }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WardenConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.default_adapter_mode, AdapterMode::Native);
        assert_eq!(config.sandbox.image, "ubuntu:22.04");
        assert_eq!(config.sandbox.tier, ResourceTier::Standard);
        assert_eq!(config.sandbox.container_workspace, "/workspace");
        assert_eq!(config.reaper.idle_stop_after, Duration::from_secs(30 * 60));
        assert_eq!(config.reaper.idle_destroy_after, Duration::from_secs(1440 * 60));
        assert!(config.reaper.retain_volume);
        assert_eq!(config.timeouts.stat, Duration::from_secs(10));
        assert_eq!(config.limits.max_read_bytes, 10 * 1024 * 1024);
        assert!(config.database_url.starts_with("sqlite://"));
    }

    #[test]
    fn test_overrides() {
        let config = WardenConfig::from_lookup(lookup_from(&[
            (WARDEN_ADAPTER_MODE, "sandboxed"),
            (WARDEN_SANDBOX_TIER, "LARGE"),
            (WARDEN_IDLE_STOP_MINUTES, "5"),
            (WARDEN_IDLE_DESTROY_MINUTES, "60"),
            (WARDEN_RETAIN_VOLUME_ON_REAP, "no"),
            (WARDEN_TIMEOUT_EXEC_SECONDS, "15"),
            (WARDEN_NATIVE_WORKSPACE_ROOT, "/srv/warden"),
        ]))
        .unwrap();

        assert_eq!(config.default_adapter_mode, AdapterMode::Sandboxed);
        assert_eq!(config.sandbox.tier, ResourceTier::Large);
        assert_eq!(config.reaper.idle_stop_after, Duration::from_secs(300));
        assert_eq!(config.reaper.idle_destroy_after, Duration::from_secs(3600));
        assert!(!config.reaper.retain_volume);
        assert_eq!(config.timeouts.exec, Duration::from_secs(15));
        assert_eq!(
            config.paths.native_workspace_root,
            PathBuf::from("/srv/warden")
        );
    }

    #[test]
    fn test_destroy_threshold_must_exceed_stop_threshold() {
        let err = WardenConfig::from_lookup(lookup_from(&[
            (WARDEN_IDLE_STOP_MINUTES, "60"),
            (WARDEN_IDLE_DESTROY_MINUTES, "60"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::ReaperThresholds { .. }));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = WardenConfig::from_lookup(lookup_from(&[(WARDEN_MAX_READ_BYTES, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));

        let err = WardenConfig::from_lookup(lookup_from(&[(WARDEN_STATS_INTERVAL_SECONDS, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero { .. }));

        let err = WardenConfig::from_lookup(lookup_from(&[(WARDEN_ADAPTER_MODE, "remote")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAdapterMode(_)));
    }

    #[rstest]
    #[case("native", AdapterMode::Native)]
    #[case("Sandboxed", AdapterMode::Sandboxed)]
    #[case("container", AdapterMode::Sandboxed)]
    fn test_adapter_mode_parsing(#[case] raw: &str, #[case] expected: AdapterMode) {
        assert_eq!(raw.parse::<AdapterMode>().unwrap(), expected);
    }

    #[test]
    fn test_tier_limits_grow() {
        assert!(ResourceTier::Small.memory_mb() < ResourceTier::Standard.memory_mb());
        assert!(ResourceTier::Standard.cpu_cores() < ResourceTier::Large.cpu_cores());
    }
}
