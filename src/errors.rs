use crate::{
    models::{session::SessionStatus, video::WorkflowStatus},
    services::{
        gateway::{GatewayError, local::PartWriteError},
        registrar::RegistrarError,
        session_store::StoreError,
    },
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Every failure an upload session operation can report.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid file: {0}")]
    InvalidFile(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("video `{0}` not found")]
    VideoNotFound(Uuid),
    #[error("cannot move a video from `{from}` to `{to}`")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    #[error("cannot {action} a session that is {status}")]
    InvalidState {
        status: SessionStatus,
        action: &'static str,
    },
    #[error("part {part_number} is outside 1..={part_count}")]
    InvalidPart { part_number: u32, part_count: u32 },
    #[error("part {part_number} already has etag `{recorded}`")]
    PartConflict { part_number: u32, recorded: String },
    #[error("{} part(s) have not been reported", missing.len())]
    IncompletePartSet { missing: Vec<u32> },
    #[error("completion of session `{0}` is already running")]
    CompletionInProgress(Uuid),
    #[error("object store unavailable: {0}")]
    StorageUnavailable(String),
    #[error("object store call `{0}` timed out")]
    StorageTimeout(&'static str),
    #[error("multipart upload `{0}` no longer exists")]
    InvalidUploadId(String),
    #[error("object store rejected the part list: {0}")]
    PartMismatch(String),
    #[error("video registration failed: {0}")]
    RegistrationFailed(String),
    #[error("database error: {0}")]
    Database(String),
}

impl UploadError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFile(_) => "invalid_file",
            Self::SessionNotFound(_) => "session_not_found",
            Self::VideoNotFound(_) => "video_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidPart { .. } => "invalid_part",
            Self::PartConflict { .. } => "part_conflict",
            Self::IncompletePartSet { .. } => "incomplete_part_set",
            Self::CompletionInProgress(_) => "completion_in_progress",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::StorageTimeout(_) => "storage_timeout",
            Self::InvalidUploadId(_) => "invalid_upload_id",
            Self::PartMismatch(_) => "part_mismatch",
            Self::RegistrationFailed(_) => "registration_failed",
            Self::Database(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidFile(_) | Self::InvalidPart { .. } | Self::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound(_) | Self::VideoNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. }
            | Self::PartConflict { .. }
            | Self::IncompletePartSet { .. }
            | Self::CompletionInProgress(_) => StatusCode::CONFLICT,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidUploadId(_) => StatusCode::GONE,
            Self::PartMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RegistrationFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GatewayError> for UploadError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => Self::StorageUnavailable(msg),
            GatewayError::Timeout(op) => Self::StorageTimeout(op),
            GatewayError::InvalidUploadId(id) => Self::InvalidUploadId(id),
            GatewayError::PartMismatch(msg) => Self::PartMismatch(msg),
            GatewayError::NotFound(key) => {
                Self::StorageUnavailable(format!("object `{}` is missing", key))
            }
            GatewayError::InvalidKey(key) => {
                Self::InvalidFile(format!("filename produces an unusable key `{}`", key))
            }
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "session store failure");
        Self::Database(err.to_string())
    }
}

impl From<RegistrarError> for UploadError {
    fn from(err: RegistrarError) -> Self {
        match err {
            RegistrarError::NotFound(id) => Self::VideoNotFound(id),
            RegistrarError::KeyMismatch { .. } => Self::RegistrationFailed(err.to_string()),
            RegistrarError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            RegistrarError::Database(db_err) => {
                tracing::error!(error = %db_err, "video library failure");
                Self::Database(db_err.to_string())
            }
        }
    }
}

/// Error rendered by HTTP handlers as `{error, code, status, missingParts?}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub missing_parts: Option<Vec<u32>>,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            missing_parts: None,
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        });
        if let Some(missing) = self.missing_parts {
            body["missingParts"] = json!(missing);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let mut app = AppError::new(err.status(), err.code(), err.to_string());
        if let UploadError::IncompletePartSet { missing } = err {
            app.missing_parts = Some(missing);
        }
        app
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
            GatewayError::InvalidKey(_) => AppError::bad_request(err.to_string()),
            other => UploadError::from(other).into(),
        }
    }
}

impl From<PartWriteError> for AppError {
    fn from(err: PartWriteError) -> Self {
        match err {
            PartWriteError::BadSignature => {
                AppError::new(StatusCode::FORBIDDEN, "invalid_signature", err.to_string())
            }
            PartWriteError::Expired => {
                AppError::new(StatusCode::FORBIDDEN, "url_expired", err.to_string())
            }
            PartWriteError::InvalidPart(_) => {
                AppError::new(StatusCode::BAD_REQUEST, "invalid_part", err.to_string())
            }
            PartWriteError::Gateway(inner) => inner.into(),
        }
    }
}
