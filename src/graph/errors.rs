//! Graph API Error Types
//!
//! Structured errors for calls to the drive API and the OAuth token endpoint.
//! HTTP status codes map to specific variants so callers can tell
//! credential problems from transient failures.

/// Remote call error types
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Access token rejected")]
    Unauthorized,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Token exchange rejected: {0}")]
    TokenRejected(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Request error: {0}")]
    Request(String),
}

impl RemoteError {
    /// Whether this error is worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited
                | RemoteError::Timeout
                | RemoteError::Network(_)
                | RemoteError::Server(_, _)
        )
    }

    /// Create a RemoteError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::Forbidden(body.to_string()),
            404 => RemoteError::NotFound(body.to_string()),
            408 => RemoteError::Timeout,
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::Server(status, body.to_string()),
            _ => RemoteError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_connect() {
            RemoteError::Network(err.to_string())
        } else if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else {
            RemoteError::Request(err.to_string())
        }
    }
}
