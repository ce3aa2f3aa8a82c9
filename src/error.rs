use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Already started: {0}")]
    AlreadyStarted(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl AppError {
    /// Warnings the caller may log and carry on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppError::AlreadyStarted(_))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) | AppError::AlreadyStarted(_) => StatusCode::CONFLICT,
            AppError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Configuration(_) | AppError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
