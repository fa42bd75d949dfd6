//! The session client: one instance per application.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::auth::AuthEndpoints;
use crate::config::SessionConfig;
use crate::csrf::{CsrfCache, CsrfToken};
use crate::error::{Error, Result};
use crate::lifecycle::{LogoutReason, SessionEvent, SessionLifecycle};
use crate::pipeline::RequestPipeline;
use crate::refresh::{RefreshCoordinator, RefreshReason, RefreshState};
use crate::session::Session;
use crate::store::{MemoryTokenStore, SharedTokenStore};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

/// Authenticated API client with automatic token refresh.
///
/// Cheap to clone; clones share the token store, the CSRF cache and the
/// refresh coordinator.
///
/// # Example
///
/// ```no_run
/// use palisade_session::{Session, SessionClient};
///
/// # async fn example() -> palisade_session::Result<()> {
/// let client = SessionClient::builder()
///     .base_url("https://api.example.com")
///     .build()?;
/// client.init();
///
/// let documents: serde_json::Value = client.get_json("/documents").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SessionConfig,
    store: SharedTokenStore,
    csrf: CsrfCache,
    lifecycle: Arc<SessionLifecycle>,
    refresh: RefreshCoordinator,
    pipeline: RequestPipeline,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("base_url", &self.inner.config.base_url)
            .field("lifecycle", &self.inner.lifecycle)
            .field("refresh", &self.inner.refresh)
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate the stored session. Call once at startup.
    ///
    /// Returns the restored session, if any. A stored session that cannot be
    /// read or is malformed is cleared and reported as
    /// [`LogoutReason::InvalidStoredSession`].
    pub fn init(&self) -> Option<Session> {
        self.inner.refresh.rearm();
        self.inner.lifecycle.restore()
    }

    /// Stop all session activity. Waiters on an in-flight refresh are
    /// rejected and refreshes are refused until the next
    /// [`establish`](Self::establish) or [`init`](Self::init). Stored tokens
    /// are kept.
    pub fn dispose(&self) {
        let rejected = self.inner.refresh.cancel();
        self.inner.csrf.clear();
        debug!(rejected, "Session client disposed");
    }

    /// Install a session obtained by login, registration or SSO.
    pub fn establish(&self, session: Session) -> Result<()> {
        if !session.is_well_formed() {
            return Err(Error::Config("session has an empty token".to_string()));
        }
        self.inner.refresh.abort_in_flight();
        self.inner.lifecycle.establish(&session)?;
        self.inner.refresh.rearm();
        Ok(())
    }

    /// Explicit logout. An in-flight refresh is cancelled immediately; its
    /// waiters fail with [`Error::SessionCancelled`] and its result is never
    /// written.
    pub fn logout(&self) {
        let rejected = self.inner.refresh.cancel();
        if self.inner.lifecycle.force_logout(LogoutReason::UserInitiated) {
            info!(rejected, "Logged out");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    /// Copy of the current session, if any.
    pub fn session(&self) -> Result<Option<Session>> {
        Ok(self.inner.store.get()?)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lifecycle.is_authenticated()
    }

    /// Receive [`SessionEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.lifecycle.subscribe()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.refresh.state()
    }

    /// Number of refresh endpoint calls made by this client.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh.refresh_count()
    }

    /// Refresh now, or join the refresh already running.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh.refresh(RefreshReason::Manual).await
    }

    /// Current anti-forgery token, fetching one if needed.
    pub async fn csrf_token(&self) -> Result<CsrfToken> {
        self.inner.csrf.ensure().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Send a request through the pipeline.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.inner.pipeline.send(request).await
    }

    /// GET `path` and decode the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(&ApiRequest::get(path)).await?.json()
    }

    /// POST `body` as JSON and decode the response.
    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = ApiRequest::post(path).with_json(body)?;
        self.send(&request).await?.json()
    }

    /// PUT `body` as JSON and decode the response.
    pub async fn put_json<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = ApiRequest::put(path).with_json(body)?;
        self.send(&request).await?.json()
    }

    /// PATCH `body` as JSON and decode the response.
    pub async fn patch_json<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = ApiRequest::patch(path).with_json(body)?;
        self.send(&request).await?.json()
    }

    /// DELETE `path`.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(&ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Upload one file as multipart form data.
    pub async fn upload(
        &self,
        path: &str,
        file_name: &str,
        content_type: &str,
        data: impl Into<Bytes>,
    ) -> Result<ApiResponse> {
        let request = ApiRequest::upload(path, file_name, content_type, data);
        self.send(&request).await
    }
}

/// Builder for creating a [`SessionClient`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: SessionConfig,
    token_store: Option<SharedTokenStore>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the base URL for the server.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Durable token storage. Defaults to [`MemoryTokenStore`].
    pub fn token_store(mut self, store: SharedTokenStore) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Network transport. Defaults to [`HttpTransport`] over the configured
    /// base URL.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<SessionClient> {
        let config = self.config;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                if config.base_url.is_empty() {
                    return Err(Error::Config("base_url is required".to_string()));
                }
                Arc::new(HttpTransport::new(&config)?)
            }
        };
        let store = self
            .token_store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()));

        let endpoints = AuthEndpoints::from_config(&config);
        let csrf = CsrfCache::new(Arc::clone(&transport), endpoints.clone(), config.csrf_ttl);
        let lifecycle = SessionLifecycle::new(Arc::clone(&store), csrf.clone());
        let refresh = RefreshCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&lifecycle),
            Arc::clone(&transport),
            endpoints,
            config.refresh_timeout,
        );
        let pipeline = RequestPipeline::new(
            &config,
            transport,
            Arc::clone(&store),
            csrf.clone(),
            refresh.clone(),
            Arc::clone(&lifecycle),
        )?;

        Ok(SessionClient {
            inner: Arc::new(ClientInner {
                config,
                store,
                csrf,
                lifecycle,
                refresh,
                pipeline,
            }),
        })
    }
}
