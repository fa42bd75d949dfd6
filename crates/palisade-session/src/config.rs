//! Configuration for the session layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default path of the refresh endpoint.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Default path of the CSRF token endpoint.
pub const DEFAULT_CSRF_PATH: &str = "/auth/csrf-token";

/// Default header carrying the CSRF token on state-changing requests.
pub const DEFAULT_CSRF_HEADER: &str = "X-CSRF-Token";

/// Default lifetime of a cached CSRF token (10 minutes).
pub const DEFAULT_CSRF_TTL: Duration = Duration::from_secs(10 * 60);

/// Default bound on the refresh network call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for regular requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Access tokens expiring within this window are refreshed before sending.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(30);

/// Configuration for a [`SessionClient`](crate::SessionClient).
///
/// Durations are written as (possibly fractional) seconds in TOML:
///
/// ```toml
/// base_url = "https://api.example.com"
/// csrf_ttl_secs = 600
/// refresh_timeout_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL every request path is resolved against.
    pub base_url: String,

    /// Path of the token refresh endpoint.
    pub refresh_path: String,

    /// Path of the CSRF token endpoint.
    pub csrf_path: String,

    /// Header name for the CSRF token.
    pub csrf_header: String,

    /// Lifetime of a cached CSRF token.
    #[serde(rename = "csrf_ttl_secs", with = "duration_secs")]
    pub csrf_ttl: Duration,

    /// Bound on the refresh network call. Expiry counts as refresh failure.
    #[serde(rename = "refresh_timeout_secs", with = "duration_secs")]
    pub refresh_timeout: Duration,

    /// Timeout for regular requests.
    #[serde(rename = "request_timeout_secs", with = "duration_secs")]
    pub request_timeout: Duration,

    /// Refresh proactively when the access token expires within this window.
    /// Zero disables proactive refresh.
    #[serde(rename = "expiry_buffer_secs", with = "duration_secs")]
    pub expiry_buffer: Duration,

    /// End the session when a replayed request is still rejected with 401.
    pub logout_on_unauthorized: bool,

    /// Custom user agent.
    pub user_agent: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            csrf_path: DEFAULT_CSRF_PATH.to_string(),
            csrf_header: DEFAULT_CSRF_HEADER.to_string(),
            csrf_ttl: DEFAULT_CSRF_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            logout_on_unauthorized: true,
            user_agent: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration pointing at the given server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Set the server base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the refresh endpoint path.
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    /// Set the CSRF endpoint path.
    pub fn with_csrf_path(mut self, path: impl Into<String>) -> Self {
        self.csrf_path = path.into();
        self
    }

    /// Set the CSRF header name.
    pub fn with_csrf_header(mut self, header: impl Into<String>) -> Self {
        self.csrf_header = header.into();
        self
    }

    /// Set the CSRF token lifetime.
    pub fn with_csrf_ttl(mut self, ttl: Duration) -> Self {
        self.csrf_ttl = ttl;
        self
    }

    /// Set the refresh timeout.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the proactive refresh window.
    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Enable or disable logout after an exhausted 401.
    pub fn with_logout_on_unauthorized(mut self, enabled: bool) -> Self {
        self.logout_on_unauthorized = enabled;
        self
    }

    /// Set a custom user agent.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

/// Serde adapter writing durations as seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
