use std::path::PathBuf;

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TranscodeError>;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("max concurrent transcode tasks reached ({0})")]
    ConcurrencyLimit(usize),

    #[error("transcode task not found: {0}")]
    TaskNotFound(String),

    #[error("failed to resolve source {key}: {reason}")]
    Resolution { key: String, reason: String },

    #[error("encoder binary not found: {}", .0.display())]
    EncoderNotFound(PathBuf),

    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("playlist not ready")]
    PlaylistNotReady,

    #[error("segment {0} not ready")]
    SegmentNotReady(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscodeError::ConcurrencyLimit(_)
            | TranscodeError::PlaylistNotReady
            | TranscodeError::SegmentNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            TranscodeError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            TranscodeError::Resolution { .. } => StatusCode::BAD_GATEWAY,
            TranscodeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TranscodeError::EncoderNotFound(_)
            | TranscodeError::Spawn(_)
            | TranscodeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client should simply try again shortly.
    pub fn is_retryable(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }
}

impl IntoResponse for TranscodeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut builder = Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Cache-Control", "no-store");
        if self.is_retryable() {
            builder = builder.header("Retry-After", "1");
        }
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| status.into_response())
    }
}
