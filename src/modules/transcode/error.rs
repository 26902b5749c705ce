use axum::http::StatusCode;
use thiserror::Error;

use crate::common::response::ApiError;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transcode server busy, {queued} task(s) waiting for a slot")]
    Busy { queued: usize },

    #[error("Encoder exceeded {seconds}s wall-clock budget")]
    Timeout { seconds: u64 },

    #[error("Transcode interrupted")]
    Interrupted,

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: i32, last_error: String },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TranscodeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscodeError::NotFound(_) => StatusCode::NOT_FOUND,
            TranscodeError::Invalid(_) => StatusCode::BAD_REQUEST,
            TranscodeError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for TranscodeError {
    fn from(e: std::io::Error) -> Self {
        TranscodeError::Internal(e.into())
    }
}

impl From<TranscodeError> for ApiError {
    fn from(e: TranscodeError) -> Self {
        ApiError(e.to_string(), e.status_code())
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
