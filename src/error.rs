//! Crate-wide error taxonomy
//!
//! Mirrors the teacher's `error::DaemonError` pattern: a flat `thiserror`
//! enum that both propagates through the core and renders itself as an
//! HTTP response at the (external, thin) API boundary.

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

/// The error taxonomy from the daemon specification.
///
/// Every fallible core operation returns one of these variants. The HTTP
/// layer maps them 1:1 to status codes; nothing upstream needs to know
/// which subsystem produced the error.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("No such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("ambiguous ID prefix: {0}")]
    AmbiguousPrefix(String),

    #[error("name already in use: {0}")]
    NameConflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("control plane unavailable")]
    ControlPlaneUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        DaemonError::NotFound { kind, id: id.into() }
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(e: rusqlite::Error) -> Self {
        DaemonError::Internal(format!("store error: {e}"))
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(e: std::io::Error) -> Self {
        DaemonError::Internal(format!("io error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DaemonError::NotFound { .. } => StatusCode::NOT_FOUND,
            DaemonError::AmbiguousPrefix(_) => StatusCode::BAD_REQUEST,
            DaemonError::NameConflict(_) => StatusCode::CONFLICT,
            DaemonError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DaemonError::InvalidState(_) => StatusCode::CONFLICT,
            DaemonError::Conflict(_) => StatusCode::CONFLICT,
            DaemonError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            DaemonError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            DaemonError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            DaemonError::OperationNotPermitted(_) => StatusCode::FORBIDDEN,
            DaemonError::ControlPlaneUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
