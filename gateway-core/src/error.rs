//! Uniform error type shared by every component.
//!
//! Mirrors the spec's error-kind taxonomy (client-fault, host-fault,
//! io-fault, configuration-fault, internal) rather than wrapping source
//! exception types directly, so HTTP and WebSocket serialization stay
//! identical regardless of where the error originated.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Broad classification of an error, independent of its numeric status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClientFault,
    HostFault,
    IoFault,
    ConfigurationFault,
    Internal,
}

/// The single error type produced by request handlers and components.
///
/// Carries a numeric status (reused verbatim as the HTTP status code and
/// as the WebSocket JSON-RPC error `code`) and a human-readable message.
/// Never exposes a raw backtrace or source-language traceback to callers.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientFault, 400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientFault, 401, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientFault, 403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientFault, 404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientFault, 409, message)
    }

    /// The printer host is disconnected, timed out, or returned an error.
    pub fn host_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostFault, 503, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoFault, 500, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationFault, 500, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, 500, message)
    }

    /// Serializable `{code, message}` pair for the WebSocket JSON-RPC error field.
    pub fn as_rpc_error(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.status as i64,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({"error": {"message": self.message, "status": self.status}}))).into_response()
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::new(ErrorKind::IoFault, 403, err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("malformed json: {err}"))
    }
}

impl From<sled::Error> for GatewayError {
    fn from(err: sled::Error) -> Self {
        Self::internal(format!("database error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
