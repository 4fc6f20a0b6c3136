// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Error types: the sync engine's failure taxonomy and the HTTP-facing
//! application error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Failure classes of a synchronization run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// No usable credentials for the profile.
    #[error("No usable credentials: {0}")]
    AuthFailure(String),

    /// The refresh token was rejected; the user must authorize again.
    #[error("Re-authorization required: {0}")]
    ReauthorizationRequired(String),

    #[error("Token refresh failed after {attempts} attempts: {last_error}")]
    RefreshTransientFailure { attempts: u32, last_error: String },

    /// Quota exhausted and the allowed number of waits used up.
    #[error("Rate limited after {waits} waits")]
    RateLimited { waits: u32 },

    #[error("Transient HTTP failure after {attempts} attempts: {last_error}")]
    HttpTransientFailure { attempts: u32, last_error: String },

    #[error("HTTP {status}: {body}")]
    HttpPermanentFailure { status: u16, body: String },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Serializable discriminant of [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum ErrorKind {
    AuthFailure,
    ReauthorizationRequired,
    RefreshTransientFailure,
    RateLimited,
    HttpTransientFailure,
    HttpPermanentFailure,
    StorageFailure,
    Cancelled,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::AuthFailure(_) => ErrorKind::AuthFailure,
            SyncError::ReauthorizationRequired(_) => ErrorKind::ReauthorizationRequired,
            SyncError::RefreshTransientFailure { .. } => ErrorKind::RefreshTransientFailure,
            SyncError::RateLimited { .. } => ErrorKind::RateLimited,
            SyncError::HttpTransientFailure { .. } => ErrorKind::HttpTransientFailure,
            SyncError::HttpPermanentFailure { .. } => ErrorKind::HttpPermanentFailure,
            SyncError::StorageFailure(_) => ErrorKind::StorageFailure,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only missing or revoked credentials end a whole job: without a token
    /// no sibling task can make progress either.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFailure(_) | SyncError::ReauthorizationRequired(_)
        )
    }
}

/// Persistence errors for credential and metric files.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::StorageFailure(err.to_string())
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg.clone())),
            AppError::Sync(err) if err.is_job_fatal() => {
                (StatusCode::UNAUTHORIZED, "reauthorization_required", Some(err.to_string()))
            }
            AppError::Sync(err) => (StatusCode::BAD_GATEWAY, "fitbit_error", Some(err.to_string())),
            AppError::Store(StoreError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "not_found", Some(msg.clone()))
            }
            AppError::Store(err) => {
                tracing::error!(error = %err, "Storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
