//! Error types for the transport layer.
//!
//! Every failure surfaced to a client rides in an error response envelope
//! carrying a stable machine-readable code alongside a human-readable
//! message. Handler failures never crash the connection.

use crate::auth::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coop_storage::StorageError;
use coop_tasks::TaskError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes carried in error response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication
    AuthRequired,
    InvalidFormat,
    InvalidKey,
    InvalidToken,
    InvalidSignature,
    TokenExpired,
    InvalidIssuer,
    InvalidAudience,
    NotConfigured,
    PermissionDenied,
    UnknownStrategy,

    // Request handling
    RateLimited,
    InvalidRequest,
    UnknownOperation,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// Wire form of the code, e.g. `AUTH_REQUIRED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::InvalidKey => "INVALID_KEY",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::InvalidIssuer => "INVALID_ISSUER",
            ErrorCode::InvalidAudience => "INVALID_AUDIENCE",
            ErrorCode::NotConfigured => "NOT_CONFIGURED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::UnknownStrategy => "UNKNOWN_STRATEGY",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnknownOperation => "UNKNOWN_OPERATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired
            | ErrorCode::InvalidFormat
            | ErrorCode::InvalidKey
            | ErrorCode::InvalidToken
            | ErrorCode::InvalidSignature
            | ErrorCode::TokenExpired
            | ErrorCode::InvalidIssuer
            | ErrorCode::InvalidAudience => StatusCode::UNAUTHORIZED,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidRequest | ErrorCode::UnknownOperation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::NotConfigured
            | ErrorCode::UnknownStrategy
            | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error surfaced to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<TaskError> for ServerError {
    fn from(err: TaskError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_request(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        (status, Json(self)).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
