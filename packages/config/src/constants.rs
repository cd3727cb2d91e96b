// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Warden

// Storage
pub const WARDEN_DATABASE_URL: &str = "WARDEN_DATABASE_URL";

// Adapter selection
pub const WARDEN_ADAPTER_MODE: &str = "WARDEN_ADAPTER_MODE";

// Sandbox container configuration
pub const WARDEN_SANDBOX_IMAGE: &str = "WARDEN_SANDBOX_IMAGE";
pub const WARDEN_SANDBOX_TIER: &str = "WARDEN_SANDBOX_TIER";
pub const WARDEN_CONTAINER_WORKSPACE: &str = "WARDEN_CONTAINER_WORKSPACE";
pub const WARDEN_CREATE_TIMEOUT_SECONDS: &str = "WARDEN_CREATE_TIMEOUT_SECONDS";
pub const WARDEN_HEALTH_TTL_SECONDS: &str = "WARDEN_HEALTH_TTL_SECONDS";
pub const WARDEN_STOP_GRACE_SECONDS: &str = "WARDEN_STOP_GRACE_SECONDS";

// Native mode paths
pub const WARDEN_NATIVE_WORKSPACE_ROOT: &str = "WARDEN_NATIVE_WORKSPACE_ROOT";
pub const WARDEN_NATIVE_SESSIONS_ROOT: &str = "WARDEN_NATIVE_SESSIONS_ROOT";
pub const WARDEN_SANDBOX_SESSIONS_ROOT: &str = "WARDEN_SANDBOX_SESSIONS_ROOT";

// Idle reaping
pub const WARDEN_IDLE_STOP_MINUTES: &str = "WARDEN_IDLE_STOP_MINUTES";
pub const WARDEN_IDLE_DESTROY_MINUTES: &str = "WARDEN_IDLE_DESTROY_MINUTES";
pub const WARDEN_REAPER_INTERVAL_SECONDS: &str = "WARDEN_REAPER_INTERVAL_SECONDS";
pub const WARDEN_RETAIN_VOLUME_ON_REAP: &str = "WARDEN_RETAIN_VOLUME_ON_REAP";

// Stats polling
pub const WARDEN_STATS_INTERVAL_SECONDS: &str = "WARDEN_STATS_INTERVAL_SECONDS";

// Per-operation timeouts
pub const WARDEN_TIMEOUT_READ_SECONDS: &str = "WARDEN_TIMEOUT_READ_SECONDS";
pub const WARDEN_TIMEOUT_WRITE_SECONDS: &str = "WARDEN_TIMEOUT_WRITE_SECONDS";
pub const WARDEN_TIMEOUT_STAT_SECONDS: &str = "WARDEN_TIMEOUT_STAT_SECONDS";
pub const WARDEN_TIMEOUT_TREE_SECONDS: &str = "WARDEN_TIMEOUT_TREE_SECONDS";
pub const WARDEN_TIMEOUT_EXEC_SECONDS: &str = "WARDEN_TIMEOUT_EXEC_SECONDS";

// File size limits
pub const WARDEN_MAX_READ_BYTES: &str = "WARDEN_MAX_READ_BYTES";
pub const WARDEN_MAX_WRITE_BYTES: &str = "WARDEN_MAX_WRITE_BYTES";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
