pub mod handlers;

use thiserror::Error;
use tracing::{error, warn};

use crate::repository::RepositoryError;

/// Failure kinds every hypervisor backend reports. Backend specific errors
/// (HTTP, JSON, TLS) are folded into these before they leave the adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Hypervisor unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Resource not found on any node: {0}")]
    ResourceNotFound(String),

    #[error("Template {template_id} not found on any node")]
    TemplateNotFound { template_id: u32 },

    #[error("VM {vm_id} not found on any node")]
    VmNotFound { vm_id: u32 },

    #[error("Hypervisor rejected {operation}: {message}")]
    BackendOperationFailed { operation: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HypervisorError {
    pub fn operation_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HypervisorError::BackendOperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True when the call reached the backend and the backend said no.
    pub fn is_rejection(&self) -> bool {
        matches!(self, HypervisorError::BackendOperationFailed { .. })
    }
}

/// A composite operation that left its main side effect in place while a
/// follow-up step failed. Logged, never raised.
#[derive(Debug, Clone)]
pub struct PartialSuccess {
    pub vm_id: u32,
    pub node: String,
    pub step: &'static str,
    pub reason: String,
}

impl PartialSuccess {
    pub fn log(&self) {
        warn!(
            vm_id = self.vm_id,
            node = %self.node,
            step = self.step,
            reason = %self.reason,
            "VM created but follow-up step failed"
        );
    }
}

/// Errors surfaced by the orchestration entry points.
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Hypervisor Error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Repository Error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LabError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        LabError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

pub type HypervisorResult<T> = Result<T, HypervisorError>;
pub type LabResult<T> = Result<T, LabError>;

/// Logs an error together with the operation that produced it and passes
/// the result through untouched.
#[macro_export]
macro_rules! with_context {
    ($result:expr, $operation:expr) => {
        $result.map_err(|e| {
            $crate::errors::log_failure($operation, std::file!(), &e);
            e
        })
    };
}

pub fn log_failure(operation: &str, source_location: &'static str, err: &dyn std::fmt::Display) {
    error!(
        error = %err,
        operation,
        source_location,
        at = %chrono::Utc::now(),
        "Operation failed"
    );
}
