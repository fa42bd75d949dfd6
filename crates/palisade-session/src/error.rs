//! Error types for the session layer.
//!
//! Every failure a caller can observe is normalized into [`Error`]. The type
//! is `Clone` because a single refresh outcome is fanned out to every caller
//! queued behind it.

use thiserror::Error;

/// Session layer error type.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No response was received (offline, DNS, connection reset, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The server rejected the credentials (HTTP 401).
    #[error("Authentication failed ({status}): {message}")]
    Auth {
        /// HTTP status code.
        status: u16,
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// The refresh endpoint failed, timed out, or returned an unusable payload.
    ///
    /// Always fatal for the current session.
    #[error("Token refresh failed: {0}")]
    RefreshFailure(String),

    /// The session was ended by an explicit logout while this call waited.
    #[error("Session cancelled")]
    SessionCancelled,

    /// The anti-forgery token could not be fetched.
    #[error("CSRF token fetch failed: {0}")]
    CsrfFetch(String),

    /// Client-side error other than 401 (400, 403, 404, 409, 422, 429, ...).
    #[error("Request rejected ({status}): {message}")]
    Validation {
        /// HTTP status code.
        status: u16,
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// Server-side error (5xx).
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// Non-success status outside 4xx and 5xx (1xx, 3xx).
    #[error("Unexpected response ({status}): {message}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// Durable token storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e.to_string())
    }
}

impl Error {
    /// Normalize a non-success HTTP response into the error taxonomy.
    ///
    /// The body is parsed as `{ "code": ..., "message": ... }` when possible.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let (code, message) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(body) => (
                body.code.unwrap_or_else(|| "unknown".to_string()),
                body.message.unwrap_or_else(|| format!("HTTP {}", status)),
            ),
            Err(_) => ("unknown".to_string(), format!("HTTP {}", status)),
        };

        match status {
            401 => Error::Auth {
                status,
                code,
                message,
            },
            400..=499 => Error::Validation {
                status,
                code,
                message,
            },
            500..=599 => Error::Server {
                status,
                code,
                message,
            },
            _ => Error::UnexpectedStatus {
                status,
                code,
                message,
            },
        }
    }

    /// HTTP status associated with this error, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Auth { status, .. }
            | Error::Validation { status, .. }
            | Error::Server { status, .. }
            | Error::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Error::Auth { code, .. }
            | Error::Validation { code, .. }
            | Error::Server { code, .. }
            | Error::UnexpectedStatus { code, .. } => code,
            Error::Network(_) => "network_error",
            Error::RefreshFailure(_) => "refresh_failed",
            Error::SessionCancelled => "session_cancelled",
            Error::CsrfFetch(_) => "csrf_fetch_failed",
            Error::Storage(_) => "storage_error",
            Error::InvalidUrl(_) => "invalid_url",
            Error::Json(_) => "json_error",
            Error::Config(_) => "config_error",
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            Error::Auth { message, .. }
            | Error::Validation { message, .. }
            | Error::Server { message, .. }
            | Error::UnexpectedStatus { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this is an authentication error.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    /// Check if the refresh endpoint failed.
    pub fn is_refresh_failure(&self) -> bool {
        matches!(self, Error::RefreshFailure(_))
    }

    /// Check if the call was abandoned because of an explicit logout.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::SessionCancelled)
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Check if this is a server error.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Server { .. })
    }
}

/// Failures of the durable token store.
///
/// Never fatal to the request pipeline: a session that cannot be read is
/// treated as absent.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Failed to read the backing storage.
    #[error("failed to read token storage '{path}': {message}")]
    Read { path: String, message: String },

    /// Failed to write the backing storage.
    #[error("failed to write token storage '{path}': {message}")]
    Write { path: String, message: String },

    /// Stored data exists but cannot be decoded into a session.
    #[error("stored session is corrupt: {0}")]
    Corrupt(String),

    /// Storage is disabled or otherwise unusable.
    #[error("token storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for session layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error response body from the server.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
