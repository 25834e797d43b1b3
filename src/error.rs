//! # Error Handling
//!
//! HTTP-facing error type and how each failure becomes a JSON response.
//!
//! ## Layers:
//! - **LiveError** (`live::error`): tagged errors of the voice pipeline
//! - **GenAiError** (`genai::error`): failures of the model backends
//! - **AppError** (here): what handlers return; every lower error converts
//!   into it with `?`, choosing the status code on the way
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "permission_denied",
//!     "message": "microphone capture is not available",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::genai::GenAiError;
use crate::live::error::LiveError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error categories returned by HTTP handlers.
///
/// ## Status Mapping:
/// - **Internal / ConfigError** → 500
/// - **BadRequest / ValidationError** → 400
/// - **NotFound** → 404
/// - **Permission** → 403 (capture or playback could not be opened)
/// - **Upstream** → 502 (the voice service or a model backend failed)
/// - **Unavailable** → 503 (a backend is not configured)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Permission(String),
    Upstream(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Permission(msg) => write!(f, "Permission denied: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    /// Status code plus the machine-readable `type` of the JSON body.
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::Permission(msg) => (StatusCode::FORBIDDEN, "permission_denied", msg.as_str()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg.as_str()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.as_str()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Plumbing failures (config loading, file I/O) are server-side problems.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON almost always comes from the client.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

/// Voice pipeline errors.
///
/// A denied device is the caller's environment (403); a payload that failed
/// to decode is bad input (400); a broken channel is the remote service (502).
impl From<LiveError> for AppError {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::Permission(msg) => AppError::Permission(msg),
            LiveError::Decode(msg) => AppError::BadRequest(msg),
            LiveError::Transport(msg) => AppError::Upstream(msg),
        }
    }
}

impl From<GenAiError> for AppError {
    fn from(err: GenAiError) -> Self {
        match err {
            GenAiError::NotConfigured(msg) => AppError::Unavailable(msg),
            GenAiError::BadInput(msg) => AppError::BadRequest(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_live_errors_map_to_status() {
        let cases = [
            (LiveError::Permission("mic".to_string()), StatusCode::FORBIDDEN),
            (LiveError::Decode("chunk".to_string()), StatusCode::BAD_REQUEST),
            (LiveError::Transport("socket".to_string()), StatusCode::BAD_GATEWAY),
        ];
        for (live, status) in cases {
            assert_eq!(AppError::from(live).status_code(), status);
        }
    }

    #[test]
    fn test_genai_errors_map_to_status() {
        let missing = AppError::from(GenAiError::NotConfigured("no key".to_string()));
        assert_eq!(missing.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let api = AppError::from(GenAiError::Api {
            status: 429,
            message: "quota".to_string(),
        });
        assert_eq!(api.status_code(), StatusCode::BAD_GATEWAY);
        assert!(api.to_string().contains("quota"));
    }

    #[actix_web::test]
    async fn test_error_body_shape() {
        let response = AppError::Permission("microphone denied".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "permission_denied");
        assert_eq!(value["error"]["message"], "microphone denied");
        assert!(value["error"]["timestamp"].is_string());
    }
}
