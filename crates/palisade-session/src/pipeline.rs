//! The wrapper every outgoing call goes through.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::csrf::CsrfCache;
use crate::error::{Error, Result};
use crate::lifecycle::{LogoutReason, SessionLifecycle};
use crate::refresh::{RefreshCoordinator, RefreshReason};
use crate::session::Session;
use crate::store::SharedTokenStore;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Which dispatch of a request this is.
///
/// A request is sent at most twice: once as `Initial`, and once more as
/// `Replay` after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Initial,
    Replay,
}

impl Attempt {
    /// The attempt that may follow a 401, if any.
    pub fn next(self) -> Option<Attempt> {
        match self {
            Attempt::Initial => Some(Attempt::Replay),
            Attempt::Replay => None,
        }
    }
}

/// Attaches credentials, recovers from 401 through the refresh coordinator
/// and normalizes errors.
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: SharedTokenStore,
    csrf: CsrfCache,
    refresh: RefreshCoordinator,
    lifecycle: Arc<SessionLifecycle>,
    csrf_header: HeaderName,
    expiry_buffer: Duration,
    logout_on_unauthorized: bool,
}

impl RequestPipeline {
    pub fn new(
        config: &SessionConfig,
        transport: Arc<dyn Transport>,
        store: SharedTokenStore,
        csrf: CsrfCache,
        refresh: RefreshCoordinator,
        lifecycle: Arc<SessionLifecycle>,
    ) -> Result<Self> {
        let csrf_header = HeaderName::from_bytes(config.csrf_header.as_bytes()).map_err(|e| {
            Error::Config(format!("invalid CSRF header '{}': {}", config.csrf_header, e))
        })?;

        Ok(Self {
            transport,
            store,
            csrf,
            refresh,
            lifecycle,
            csrf_header,
            expiry_buffer: config.expiry_buffer,
            logout_on_unauthorized: config.logout_on_unauthorized,
        })
    }

    /// Send `request`, returning the response only if it succeeded.
    ///
    /// A 401 triggers (or joins) a refresh and the request is replayed once
    /// with the new access token. A second 401 is surfaced as
    /// [`Error::Auth`]. Every other non-success status is normalized without
    /// touching the session.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut attempt = Attempt::Initial;
        let mut session = self.current_session();

        if let Some(current) = &session
            && !self.expiry_buffer.is_zero()
            && current.expires_within(self.expiry_buffer)
        {
            debug!(%request, "Access token near expiry; refreshing before send");
            self.refresh
                .refresh_after(&current.access_token, RefreshReason::Expired)
                .await?;
            session = self.current_session();
        }

        loop {
            let headers = self.credential_headers(request, session.as_ref()).await?;
            let response = self.transport.execute(request, headers).await?;

            if response.is_success() {
                return Ok(response);
            }
            if response.status != 401 {
                return Err(response.error());
            }

            let Some(sent) = session else {
                debug!(%request, "401 without a session");
                return Err(response.error());
            };

            match attempt.next() {
                Some(next) => {
                    debug!(%request, "401 received; refreshing before replay");
                    self.refresh
                        .refresh_after(&sent.access_token, RefreshReason::Unauthorized)
                        .await?;
                    attempt = next;
                    session = self.current_session();
                }
                None => {
                    warn!(%request, "Still unauthorized after refresh");
                    if self.logout_on_unauthorized {
                        self.lifecycle.force_logout(LogoutReason::Unauthorized);
                        self.refresh.abort_in_flight();
                    }
                    return Err(response.error());
                }
            }
        }
    }

    /// Storage failures are not fatal here: the request goes out anonymously.
    fn current_session(&self) -> Option<Session> {
        match self.store.get() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to read session; sending without credentials");
                None
            }
        }
    }

    /// Headers resolved for one attempt. Never stored on the request.
    async fn credential_headers(
        &self,
        request: &ApiRequest,
        session: Option<&Session>,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        if let Some(session) = session {
            let mut value = HeaderValue::from_str(&session.bearer())
                .map_err(|_| Error::Config("access token is not a valid header value".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        if request.is_state_changing() {
            let token = self.csrf.ensure().await?;
            let value = HeaderValue::from_str(&token.value)
                .map_err(|_| Error::CsrfFetch("CSRF token is not a valid header value".to_string()))?;
            headers.insert(self.csrf_header.clone(), value);
        }

        Ok(headers)
    }
}
