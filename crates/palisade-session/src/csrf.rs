//! Time-boxed cache of the anti-forgery token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::auth::AuthEndpoints;
use crate::error::{Error, Result};
use crate::flight::{Join, SingleFlight};
use crate::transport::Transport;

/// An anti-forgery token and when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    pub fetched_at: Instant,
}

impl CsrfToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            fetched_at: Instant::now(),
        }
    }

    /// Whether the token is still within `ttl` of its fetch.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Memory-only cache of one [`CsrfToken`].
///
/// Concurrent [`ensure`](CsrfCache::ensure) calls while a fetch is
/// outstanding share that fetch.
#[derive(Clone)]
pub struct CsrfCache {
    transport: Arc<dyn Transport>,
    endpoints: AuthEndpoints,
    ttl: Duration,
    cached: Arc<Mutex<Option<CsrfToken>>>,
    flight: Arc<SingleFlight<CsrfToken>>,
}

impl std::fmt::Debug for CsrfCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfCache")
            .field("ttl", &self.ttl)
            .field("cached", &self.cached.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl CsrfCache {
    pub fn new(transport: Arc<dyn Transport>, endpoints: AuthEndpoints, ttl: Duration) -> Self {
        Self {
            transport,
            endpoints,
            ttl,
            cached: Arc::new(Mutex::new(None)),
            flight: SingleFlight::new(Error::CsrfFetch("fetch abandoned".to_string())),
        }
    }

    /// Configured token lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached token if it is still fresh.
    pub fn peek(&self) -> Option<CsrfToken> {
        self.cached
            .lock()
            .as_ref()
            .filter(|token| token.is_fresh(self.ttl))
            .cloned()
    }

    /// Return a valid token, fetching one only if none is cached or the
    /// cached one has outlived its TTL.
    pub async fn ensure(&self) -> Result<CsrfToken> {
        if let Some(token) = self.peek() {
            trace!("CSRF token cache hit");
            return Ok(token);
        }

        // Re-checked under the flight lock: a fetch may have landed between
        // the peek above and the join.
        let join = self.flight.join_with(|| self.peek())?;

        match join {
            Join::Ready(token) => Ok(token),
            Join::Follower(outcome) => {
                debug!("Waiting on in-flight CSRF fetch");
                outcome.wait().await
            }
            Join::Leader(completion, outcome) => {
                let transport = Arc::clone(&self.transport);
                let endpoints = self.endpoints.clone();
                let cached = Arc::clone(&self.cached);

                tokio::spawn(async move {
                    debug!("Fetching CSRF token");
                    let result = endpoints.fetch_csrf(transport.as_ref()).await;
                    let settled = completion.finish(result, |result| match result {
                        Ok(value) => {
                            let token = CsrfToken::new(value);
                            *cached.lock() = Some(token.clone());
                            Ok(token)
                        }
                        Err(e) => {
                            warn!(error = %e, "CSRF token fetch failed");
                            *cached.lock() = None;
                            Err(e)
                        }
                    });
                    if !settled {
                        debug!("CSRF fetch finished after cache was cleared; discarding");
                    }
                });

                outcome.wait().await
            }
        }
    }

    /// Drop the cached token. A fetch still in flight is invalidated and its
    /// waiters are rejected with `SessionCancelled`.
    pub fn clear(&self) {
        let rejected = self.flight.cancel(false);
        *self.cached.lock() = None;
        if rejected > 0 {
            debug!(rejected, "CSRF cache cleared with fetch in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ApiRequest, ApiResponse};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out `csrf-1`, `csrf-2`, ... after an optional delay.
    #[derive(Debug, Default)]
    struct CsrfServer {
        fetches: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CsrfServer {
        async fn execute(&self, _request: &ApiRequest, _headers: HeaderMap) -> Result<ApiResponse> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(Error::Network("offline".to_string()));
            }
            Ok(ApiResponse::json_body(
                200,
                &serde_json::json!({ "csrfToken": format!("csrf-{}", n) }),
            ))
        }
    }

    fn cache(server: Arc<CsrfServer>, ttl: Duration) -> CsrfCache {
        CsrfCache::new(
            server,
            AuthEndpoints::new("/auth/refresh", "/auth/csrf-token"),
            ttl,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_token_within_ttl() {
        let server = Arc::new(CsrfServer::default());
        let cache = cache(server.clone(), Duration::from_secs(600));

        let first = cache.ensure().await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = cache.ensure().await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let third = cache.ensure().await.unwrap();

        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(first.value, "csrf-1");
        assert_eq!(second.value, first.value);
        assert_eq!(third.value, first.value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetches_after_ttl() {
        let server = Arc::new(CsrfServer::default());
        let cache = cache(server.clone(), Duration::from_secs(600));

        assert_eq!(cache.ensure().await.unwrap().value, "csrf-1");
        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(cache.ensure().await.unwrap().value, "csrf-2");
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_shares_fetch() {
        let server = Arc::new(CsrfServer {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cache = cache(server.clone(), Duration::from_secs(600));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.ensure().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value, "csrf-1");
        }
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_empty() {
        let server = Arc::new(CsrfServer {
            fail: true,
            ..Default::default()
        });
        let cache = cache(server.clone(), Duration::from_secs(600));

        assert!(matches!(cache.ensure().await, Err(Error::CsrfFetch(_))));
        assert!(cache.peek().is_none());

        // Next call retries.
        assert!(cache.ensure().await.is_err());
        assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        let server = Arc::new(CsrfServer::default());
        let cache = cache(server.clone(), Duration::from_secs(600));

        cache.ensure().await.unwrap();
        cache.clear();
        assert!(cache.peek().is_none());
        assert_eq!(cache.ensure().await.unwrap().value, "csrf-2");
    }

    #[tokio::test]
    async fn test_clear_discards_in_flight_fetch() {
        let server = Arc::new(CsrfServer {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let cache = cache(server.clone(), Duration::from_secs(600));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.ensure().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.clear();

        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.peek().is_none());
    }
}
