// ABOUTME: Error types for sandbox lifecycle operations
// ABOUTME: Wraps engine and storage failures with tenant and operation context

use crate::engine::EngineError;
use crate::storage::{SandboxStatus, StorageError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Creation has not finished within the caller's wait budget. Transient.
    #[error("Sandbox for tenant {tenant_id} is not ready yet")]
    NotReady { tenant_id: String },

    /// Engine or resource failure while bringing the sandbox up
    #[error("Failed to create sandbox for tenant {tenant_id}: {reason}")]
    CreateFailed { tenant_id: String, reason: String },

    /// The sandbox exists but only `running` sandboxes accept exec
    #[error("Sandbox for tenant {tenant_id} is not running (status: {status})")]
    NotRunning {
        tenant_id: String,
        status: SandboxStatus,
    },

    #[error("No sandbox for tenant {0}")]
    NotFound(String),

    #[error("Invalid tenant id: {0:?}")]
    InvalidTenant(String),

    #[error("Engine {operation} failed for tenant {tenant_id}: {source}")]
    Engine {
        tenant_id: String,
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn engine(tenant_id: &str, operation: &'static str, source: EngineError) -> Self {
        Self::Engine {
            tenant_id: tenant_id.to_string(),
            operation,
            source,
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Rebuild an error shared between single-flight waiters.
    pub(crate) fn from_shared(tenant_id: &str, shared: &SandboxError) -> Self {
        match shared {
            Self::NotReady { tenant_id } => Self::NotReady {
                tenant_id: tenant_id.clone(),
            },
            Self::CreateFailed { tenant_id, reason } => Self::CreateFailed {
                tenant_id: tenant_id.clone(),
                reason: reason.clone(),
            },
            Self::NotRunning { tenant_id, status } => Self::NotRunning {
                tenant_id: tenant_id.clone(),
                status: *status,
            },
            Self::NotFound(t) => Self::NotFound(t.clone()),
            Self::InvalidTenant(t) => Self::InvalidTenant(t.clone()),
            Self::Engine {
                tenant_id,
                operation,
                source,
            } => Self::Engine {
                tenant_id: tenant_id.clone(),
                operation: *operation,
                source: source.clone(),
            },
            Self::Timeout { operation, after } => Self::Timeout {
                operation: *operation,
                after: *after,
            },
            Self::Storage(e) => Self::CreateFailed {
                tenant_id: tenant_id.to_string(),
                reason: e.to_string(),
            },
        }
    }
}
