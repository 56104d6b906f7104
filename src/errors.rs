use crate::{backends::BackendError, models::envelope::ResponseEnvelope};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub const NOT_FOUND_MESSAGE: &str = "The requested file was not found.";

/// Every way a gateway operation can fail, as seen by the HTTP caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed input, caught before the backend is contacted.
    #[error("{0}")]
    Validation(String),

    /// Request body above the configured upload limit.
    #[error("{0}")]
    TooLarge(String),

    #[error("{}", NOT_FOUND_MESSAGE)]
    NotFound,

    #[error("An error occurred: {kind}. {message}. Trace: {detail}")]
    Backend {
        kind: String,
        message: String,
        detail: String,
    },
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify an extractor rejection by the status axum assigned to it.
    pub fn rejected(status: StatusCode, msg: impl Into<String>) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            Self::TooLarge(msg.into())
        } else {
            Self::Validation(msg.into())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope::failure(self.status(), self.to_string())
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { .. } => Self::NotFound,
            BackendError::Failure {
                kind,
                message,
                detail,
            } => Self::Backend {
                kind,
                message,
                detail,
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.envelope().into_response()
    }
}
