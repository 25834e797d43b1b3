use std::fmt;

/// Failures talking to a hosted or local model backend.
#[derive(Debug)]
pub enum GenAiError {
    /// No API key, or the backend is switched off
    NotConfigured(String),
    /// The request never produced an HTTP response (DNS, TLS, timeout)
    Http(String),
    /// The backend answered with a non-success status
    Api { status: u16, message: String },
    /// The backend answered 2xx but the body was not what we asked for
    InvalidResponse(String),
    /// A long-running operation did not finish within its poll budget
    TimedOut(String),
    /// The caller's input cannot be sent as-is
    BadInput(String),
}

pub type GenAiResult<T> = Result<T, GenAiError>;

impl fmt::Display for GenAiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenAiError::NotConfigured(msg) => write!(f, "Backend not configured: {}", msg),
            GenAiError::Http(msg) => write!(f, "Request failed: {}", msg),
            GenAiError::Api { status, message } => write!(f, "Backend returned {}: {}", status, message),
            GenAiError::InvalidResponse(msg) => write!(f, "Unexpected response: {}", msg),
            GenAiError::TimedOut(msg) => write!(f, "Timed out: {}", msg),
            GenAiError::BadInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for GenAiError {}

impl From<reqwest::Error> for GenAiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenAiError::InvalidResponse(err.to_string())
        } else {
            GenAiError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GenAiError {
    fn from(err: serde_json::Error) -> Self {
        GenAiError::InvalidResponse(err.to_string())
    }
}

/// Pull the human-readable message out of a backend error body.
///
/// Gemini wraps it as `{"error":{"message":..}}`, Ollama as `{"error":".."}`.
pub(crate) fn api_error(status: u16, body: &str) -> GenAiError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    GenAiError::Api { status, message }
}
