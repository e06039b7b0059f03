use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] WebSocketError),

    #[error("Orchestrator error: {0}")]
    OrchestratorError(#[from] OrchestratorError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    /// Stable code carried in `{type: "error", code, message}` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::SessionError(SessionError::ConnectionLimitExceeded { .. }) => "SESSION_LIMIT",
            AppError::SessionError(SessionError::NotFound(_)) => "SESSION_NOT_FOUND",
            AppError::SessionError(SessionError::InvalidState(_)) => "INVALID_STATE",
            AppError::FrameError(e) => e.code(),
            AppError::WebSocketError(WebSocketError::InvalidFormat(_)) => "PROTOCOL_ERROR",
            AppError::WebSocketError(_) => "CONNECTION_ERROR",
            AppError::OrchestratorError(_) => "ANALYSIS_FAILED",
            AppError::ConfigError(_) => "CONFIG_ERROR",
            AppError::ValidationError(_) => "VALIDATION_ERROR",
        }
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::WebSocketError(WebSocketError::InvalidFormat(err.to_string()))
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "code": self.code(),
                "message": self.to_string()
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::SessionError(e) => match e {
                SessionError::ConnectionLimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::InvalidState(_) => StatusCode::CONFLICT,
            },
            AppError::FrameError(FrameError::FrameTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::FrameError(FrameError::UnsupportedFormat(_)) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::FrameError(_) => StatusCode::BAD_REQUEST,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::OrchestratorError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session limit reached ({max} sessions)")]
    ConnectionLimitExceeded { max: usize },

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Invalid connection state: {0}")]
    InvalidState(String),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid data URL")]
    InvalidDataUrl,

    #[error("Invalid base64 payload: {0}")]
    InvalidEncoding(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Frame too large: {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::InvalidDataUrl | FrameError::InvalidEncoding(_) => "INVALID_FRAME",
            FrameError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            FrameError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
        }
    }
}

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("Message sending failed: {0}")]
    SendError(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Analysis request failed: {0}")]
    RequestFailed(String),

    #[error("Analysis response error: {0}")]
    ResponseError(String),

    #[error("Invalid orchestrator configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_status() || err.is_decode() {
            OrchestratorError::ResponseError(err.to_string())
        } else {
            OrchestratorError::RequestFailed(err.to_string())
        }
    }
}
