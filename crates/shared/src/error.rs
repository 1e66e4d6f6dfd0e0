use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    Unauthorized,
    NotFound,
    Rejected,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Network(_))
            || matches!(self, BackendError::Status { status, .. } if *status >= 500)
    }
}

impl From<ApiError> for BackendError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Network => BackendError::Network(value.message),
            ErrorCode::Unauthorized => BackendError::Unauthorized(value.message),
            ErrorCode::NotFound => BackendError::NotFound(value.message),
            ErrorCode::Rejected => BackendError::Rejected(value.message),
            ErrorCode::Internal => BackendError::InvalidResponse(value.message),
        }
    }
}
