// ABOUTME: Error taxonomy shared by the native and sandboxed capability adapters
// ABOUTME: Sandbox lifecycle errors are normalised here so both modes fail with the same shapes

use std::time::Duration;
use thiserror::Error;
use warden_sandbox::{SandboxError, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The tenant's sandbox is still being created. Callers should retry.
    #[error("Sandbox is not ready yet")]
    NotReady,

    #[error("Sandbox is not running: {0}")]
    NotRunning(String),

    #[error("Session {0} already has an active execution")]
    DuplicateSession(String),

    #[error("Invalid working directory: {0}")]
    InvalidCwd(String),

    #[error("Execution timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Execution {0} was aborted")]
    Aborted(String),

    #[error("Execution failed: {0}")]
    ExecFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileOperationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Path escapes the workspace: {0}")]
    PathTraversal(String),

    #[error("{path} is {size} bytes, limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Sandbox is not ready yet")]
    NotReady,

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Sandbox is not ready yet")]
    NotReady,

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Settings error: {0}")]
    Settings(#[from] StorageError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Workspace unavailable: {0}")]
    Workspace(String),
}

impl From<SandboxError> for ExecutionError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::NotReady { .. } | SandboxError::NotFound(_) => Self::NotReady,
            SandboxError::NotRunning { status, .. } => Self::NotRunning(status.to_string()),
            SandboxError::Timeout { after, .. } => Self::Timeout { after },
            other => Self::ExecFailed(other.to_string()),
        }
    }
}

impl FileOperationError {
    /// Normalise a sandbox failure raised while running `operation`
    pub(crate) fn from_sandbox(e: SandboxError, operation: &'static str) -> Self {
        match e {
            SandboxError::NotReady { .. } | SandboxError::NotFound(_) => Self::NotReady,
            SandboxError::Timeout { after, .. } => Self::Timeout { operation, after },
            other => Self::Failed(other.to_string()),
        }
    }

    /// Map a host I/O error for `path` onto the shared taxonomy
    pub(crate) fn from_io(e: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            ErrorKind::NotADirectory => Self::NotADirectory(path.to_string()),
            ErrorKind::IsADirectory => Self::IsADirectory(path.to_string()),
            ErrorKind::DirectoryNotEmpty => Self::Failed(format!("{}: {}", path, NOT_EMPTY)),
            _ => Self::Failed(format!("{}: {}", path, e)),
        }
    }
}

impl SessionError {
    pub(crate) fn from_sandbox(e: SandboxError, operation: &'static str) -> Self {
        match e {
            SandboxError::NotReady { .. } | SandboxError::NotFound(_) => Self::NotReady,
            SandboxError::Timeout { after, .. } => Self::Timeout { operation, after },
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Message used by both modes when a non-recursive delete meets a populated directory
pub(crate) const NOT_EMPTY: &str = "directory not empty";
