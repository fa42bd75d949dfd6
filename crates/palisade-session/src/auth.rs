//! Calls to the authentication collaborator.
//!
//! Two endpoints are consumed:
//!
//! - `POST /auth/refresh { refreshToken } -> { accessToken, refreshToken, expiresAt | expiresIn, userId? }`
//! - `GET /auth/csrf-token -> { csrfToken }`
//!
//! Both go straight to the [`Transport`], never through the request
//! pipeline, so a failing refresh cannot recurse into another refresh.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::{ApiRequest, Transport};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    /// Seconds, accepted when the server does not send an absolute expiry.
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrfResponse {
    csrf_token: String,
}

/// Paths of the authentication endpoints.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    refresh_path: String,
    csrf_path: String,
}

impl AuthEndpoints {
    pub fn new(refresh_path: impl Into<String>, csrf_path: impl Into<String>) -> Self {
        Self {
            refresh_path: refresh_path.into(),
            csrf_path: csrf_path.into(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.refresh_path.clone(), config.csrf_path.clone())
    }

    /// Exchange `refresh_token` for a new session.
    ///
    /// Every failure, including a response that does not rotate the refresh
    /// token, is reported as [`Error::RefreshFailure`].
    pub async fn exchange(&self, transport: &dyn Transport, refresh_token: &str) -> Result<Session> {
        let request = ApiRequest::post(self.refresh_path.as_str())
            .with_json(&RefreshRequest { refresh_token })
            .map_err(|e| Error::RefreshFailure(e.to_string()))?;

        let response = transport
            .execute(&request, HeaderMap::new())
            .await
            .map_err(|e| Error::RefreshFailure(e.to_string()))?;

        if !response.is_success() {
            let err = response.error();
            return Err(Error::RefreshFailure(format!(
                "refresh endpoint returned {}: {}",
                response.status,
                err.message()
            )));
        }

        let body: RefreshResponse = response
            .json()
            .map_err(|e| Error::RefreshFailure(format!("malformed refresh response: {}", e)))?;

        if body.access_token.trim().is_empty() || body.refresh_token.trim().is_empty() {
            return Err(Error::RefreshFailure(
                "refresh response is missing a token".to_string(),
            ));
        }

        if body.refresh_token == refresh_token {
            return Err(Error::RefreshFailure(
                "refresh token was not rotated".to_string(),
            ));
        }

        let expires_at = match (body.expires_at, body.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => Utc::now() + chrono::Duration::seconds(secs),
            (None, None) => {
                return Err(Error::RefreshFailure(
                    "refresh response has no expiry".to_string(),
                ));
            }
        };

        Ok(Session {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at,
            user_id: body.user_id,
        })
    }

    /// Fetch a fresh anti-forgery token.
    pub async fn fetch_csrf(&self, transport: &dyn Transport) -> Result<String> {
        let request = ApiRequest::get(self.csrf_path.as_str());

        let response = transport
            .execute(&request, HeaderMap::new())
            .await
            .map_err(|e| Error::CsrfFetch(e.to_string()))?;

        if !response.is_success() {
            return Err(Error::CsrfFetch(format!(
                "CSRF endpoint returned {}",
                response.status
            )));
        }

        let body: CsrfResponse = response
            .json()
            .map_err(|e| Error::CsrfFetch(format!("malformed CSRF response: {}", e)))?;

        if body.csrf_token.is_empty() {
            return Err(Error::CsrfFetch("empty CSRF token".to_string()));
        }
        Ok(body.csrf_token)
    }
}
