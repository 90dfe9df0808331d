use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::{HypervisorError, LabError};
use crate::repository::RepositoryError;

/// Error body: `{"error": "<kind>", "message": "<text>"}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated(String),
    Lab(LabError),
}

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        ApiError::Lab(err)
    }
}

fn hypervisor_status(err: &HypervisorError) -> (StatusCode, &'static str) {
    match err {
        HypervisorError::BackendUnreachable(_) => (StatusCode::SERVICE_UNAVAILABLE, "backend_unreachable"),
        HypervisorError::ResourceNotFound(_) => (StatusCode::NOT_FOUND, "resource_not_found"),
        HypervisorError::TemplateNotFound { .. } => (StatusCode::NOT_FOUND, "template_not_found"),
        HypervisorError::VmNotFound { .. } => (StatusCode::NOT_FOUND, "vm_not_found"),
        HypervisorError::BackendOperationFailed { .. } => (StatusCode::BAD_GATEWAY, "backend_operation_failed"),
        HypervisorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
    }
}

impl ApiError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            ApiError::Lab(err) => match err {
                LabError::Hypervisor(e) => hypervisor_status(e),
                LabError::Repository(RepositoryError::Missing { .. }) => (StatusCode::NOT_FOUND, "not_found"),
                LabError::Repository(RepositoryError::Duplicate { .. }) => (StatusCode::CONFLICT, "conflict"),
                LabError::Repository(RepositoryError::Backend(_)) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "repository_error")
                }
                LabError::AccessDenied(_) => (StatusCode::FORBIDDEN, "access_denied"),
                LabError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                LabError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status();
        let message = match &self {
            ApiError::Unauthenticated(msg) => msg.clone(),
            ApiError::Lab(err) => err.to_string(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), kind, %message, "Request failed");
        }
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
