//! Request-facing error taxonomy.
//!
//! Every per-request failure is mapped into a [`GatewayError`] which knows its
//! own HTTP status. Refresh-time backend failures never reach this type; the
//! registry logs them and moves on.

use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::auth::AuthError;

/// Errors returned to callers of the gateway's HTTP surface.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// No trusted identity could be established.
    Unauthenticated(String),

    /// Identity established but it lacks rights to the backend.
    AccessDenied(String),

    /// Unknown backend or tool.
    NotFound(String),

    /// Malformed request body or parameters.
    BadRequest(String),

    /// Backend is disabled or could not be reached.
    BackendUnavailable(String),

    /// Session or transport failure against a protocol backend.
    ProtocolError(String),

    /// Backend answered with a non-success status that is relayed as-is.
    BackendStatus { status: u16, message: String },

    /// Required configuration is missing.
    Misconfiguration(String),

    /// Internal error occurred.
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProtocolError(_) => StatusCode::BAD_GATEWAY,
            Self::BackendStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Misconfiguration(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated(msg) => write!(f, "Authentication required: {}", msg),
            Self::AccessDenied(msg) => write!(f, "{}", msg),
            Self::NotFound(msg) => write!(f, "{}", msg),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::BackendUnavailable(msg) => write!(f, "{}", msg),
            Self::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            Self::BackendStatus { message, .. } => write!(f, "{}", message),
            Self::Misconfiguration(msg) => write!(f, "Misconfiguration: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Result type for request handling.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Directory(msg) => Self::Internal(msg),
            other => Self::Unauthenticated(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self);
        }
        (
            status,
            Json(serde_json::json!({ "detail": self.to_string() })),
        )
            .into_response()
    }
}
