//! Exactly-once token refresh.
//!
//! Any number of callers may discover at the same moment that the access
//! token is no longer accepted. The first one to reach the coordinator while
//! it is idle becomes the owner of the single network call; everyone else
//! queues behind it and receives the same outcome. Success writes the rotated
//! pair into the token store before any waiter is released, so a released
//! waiter always replays with the new access token.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::AuthEndpoints;
use crate::error::{Error, Result, StorageError};
use crate::flight::{FlightStatus, Join, SingleFlight};
use crate::lifecycle::{LogoutReason, SessionLifecycle};
use crate::session::Session;
use crate::store::SharedTokenStore;
use crate::transport::Transport;

/// What prompted a refresh. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// A request came back 401.
    Unauthorized,
    /// The access token is about to expire.
    Expired,
    /// Requested explicitly by the host application.
    Manual,
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefreshReason::Unauthorized => "401",
            RefreshReason::Expired => "expired",
            RefreshReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    /// A refresh is running; `waiters` includes the caller that started it.
    Refreshing { waiters: usize },
    /// Logged out or disposed. Refreshes are refused until rearmed.
    Cancelled,
}

/// Single-flight refresh controller.
#[derive(Clone)]
pub struct RefreshCoordinator {
    flight: Arc<SingleFlight<()>>,
    store: SharedTokenStore,
    lifecycle: Arc<SessionLifecycle>,
    transport: Arc<dyn Transport>,
    endpoints: AuthEndpoints,
    timeout: Duration,
    refresh_calls: Arc<AtomicU64>,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .field("refresh_calls", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    pub fn new(
        store: SharedTokenStore,
        lifecycle: Arc<SessionLifecycle>,
        transport: Arc<dyn Transport>,
        endpoints: AuthEndpoints,
        timeout: Duration,
    ) -> Self {
        Self {
            flight: SingleFlight::new(Error::RefreshFailure(
                "refresh task ended without a result".to_string(),
            )),
            store,
            lifecycle,
            transport,
            endpoints,
            timeout,
            refresh_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> RefreshState {
        match self.flight.status() {
            FlightStatus::Idle => RefreshState::Idle,
            FlightStatus::InFlight { waiters } => RefreshState::Refreshing { waiters },
            FlightStatus::Closed => RefreshState::Cancelled,
        }
    }

    /// Number of calls made to the refresh endpoint so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Refresh the session, or wait for the refresh already running.
    ///
    /// Resolves once the store holds the new pair. On failure every waiter
    /// gets [`Error::RefreshFailure`] and the session is logged out.
    pub async fn refresh(&self, reason: RefreshReason) -> Result<()> {
        self.run(None, reason).await
    }

    /// Like [`refresh`](Self::refresh), for a request that was rejected while
    /// carrying `sent_access_token`.
    ///
    /// When no refresh is running and the stored access token is already a
    /// different one, somebody else refreshed after the request went out;
    /// this resolves immediately so the caller just replays.
    pub async fn refresh_after(&self, sent_access_token: &str, reason: RefreshReason) -> Result<()> {
        self.run(Some(sent_access_token), reason).await
    }

    async fn run(&self, sent_access_token: Option<&str>, reason: RefreshReason) -> Result<()> {
        let join = self.flight.join_with(|| {
            let sent = sent_access_token?;
            match self.store.get() {
                Ok(Some(current)) if current.access_token != sent => Some(()),
                _ => None,
            }
        })?;

        match join {
            Join::Ready(()) => {
                debug!(%reason, "Access token already rotated; skipping refresh");
                Ok(())
            }
            Join::Follower(outcome) => {
                debug!(%reason, "Refresh in flight; queued as waiter");
                outcome.wait().await
            }
            Join::Leader(completion, outcome) => {
                info!(%reason, "Refreshing access token");
                let task = RefreshTask {
                    lifecycle: Arc::clone(&self.lifecycle),
                    transport: Arc::clone(&self.transport),
                    endpoints: self.endpoints.clone(),
                    timeout: self.timeout,
                    refresh_calls: Arc::clone(&self.refresh_calls),
                };

                // The network call lives in its own task so that dropping the
                // caller's future cannot strand the other waiters. The store
                // write happens there too, outside the flight lock, and waiters
                // are released only after it.
                tokio::spawn(async move {
                    let outcome = task.run().await;
                    if !completion.finish(outcome, |outcome| outcome) {
                        debug!("Refresh finished after cancellation; waiters already released");
                    }
                });

                outcome.wait().await
            }
        }
    }

    /// Reject every waiter with [`Error::SessionCancelled`] and refuse
    /// refreshes until [`rearm`](Self::rearm). A refresh still on the wire
    /// has its result discarded.
    ///
    /// Returns the number of waiters rejected.
    pub fn cancel(&self) -> usize {
        self.lifecycle.supersede_refreshes();
        let rejected = self.flight.cancel(true);
        info!(rejected, "Refresh coordinator cancelled");
        rejected
    }

    /// Discard the running refresh without closing the coordinator. Used when
    /// the session being refreshed is replaced or ended.
    pub(crate) fn abort_in_flight(&self) -> usize {
        self.lifecycle.supersede_refreshes();
        let rejected = self.flight.cancel(false);
        if rejected > 0 {
            debug!(rejected, "In-flight refresh superseded");
        }
        rejected
    }

    /// Accept refreshes again after [`cancel`](Self::cancel).
    pub fn rearm(&self) {
        self.flight.reopen();
    }
}

/// Everything the background refresh needs, detached from the coordinator.
struct RefreshTask {
    lifecycle: Arc<SessionLifecycle>,
    transport: Arc<dyn Transport>,
    endpoints: AuthEndpoints,
    timeout: Duration,
    refresh_calls: Arc<AtomicU64>,
}

impl RefreshTask {
    async fn run(&self) -> Result<()> {
        let (epoch, stored) = self.lifecycle.load();
        let result = self.exchange(stored).await;
        self.commit(epoch, result)
    }

    async fn exchange(
        &self,
        stored: std::result::Result<Option<Session>, StorageError>,
    ) -> Result<Session> {
        let refresh_token = match stored {
            Ok(Some(session)) => session.refresh_token,
            Ok(None) => {
                return Err(Error::RefreshFailure("no refresh token stored".to_string()));
            }
            Err(e) => return Err(Error::RefreshFailure(e.to_string())),
        };

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let exchange = self.endpoints.exchange(self.transport.as_ref(), &refresh_token);
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::RefreshFailure(format!(
                "refresh timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Store the rotated pair, or end the session, unless the session this
    /// refresh started from is already gone.
    fn commit(&self, epoch: u64, result: Result<Session>) -> Result<()> {
        let failure = match result {
            Ok(session) => match self.lifecycle.commit_refreshed(epoch, &session) {
                Ok(true) => {
                    info!(
                        user_id = ?session.user_id,
                        expires_in_secs = session.expires_in_secs(),
                        "Access token refreshed"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Session changed during refresh; rotated tokens discarded");
                    return Err(Error::SessionCancelled);
                }
                Err(e) => Error::RefreshFailure(format!("failed to store refreshed session: {}", e)),
            },
            Err(e @ Error::RefreshFailure(_)) => e,
            Err(e) => Error::RefreshFailure(e.to_string()),
        };

        if self
            .lifecycle
            .force_logout_if_current(epoch, LogoutReason::RefreshFailed)
        {
            warn!(error = %failure, "Token refresh failed; session ended");
        } else {
            warn!(error = %failure, "Token refresh failed");
        }
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csrf::CsrfCache;
    use crate::lifecycle::SessionEvent;
    use crate::store::{MemoryTokenStore, TokenStore};
    use crate::transport::{ApiRequest, ApiResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::AtomicUsize;

    /// Rotates `a{n}`/`r{n}` on every refresh call.
    #[derive(Debug, Default)]
    struct RefreshServer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RefreshServer {
        async fn execute(&self, _request: &ApiRequest, _headers: HeaderMap) -> Result<ApiResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 2;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Ok(ApiResponse::json_body(
                    401,
                    &serde_json::json!({"code": "invalid_grant", "message": "revoked"}),
                ));
            }
            Ok(ApiResponse::json_body(
                200,
                &serde_json::json!({
                    "accessToken": format!("a{}", n),
                    "refreshToken": format!("r{}", n),
                    "expiresIn": 900
                }),
            ))
        }
    }

    struct Harness {
        coordinator: RefreshCoordinator,
        store: SharedTokenStore,
        lifecycle: Arc<SessionLifecycle>,
        server: Arc<RefreshServer>,
    }

    fn harness(server: RefreshServer, timeout: Duration) -> Harness {
        let server = Arc::new(server);
        let store: SharedTokenStore = Arc::new(MemoryTokenStore::with_session(Session::new(
            "a1",
            "r1",
            Utc::now() + chrono::Duration::minutes(15),
        )));
        let endpoints = AuthEndpoints::new("/auth/refresh", "/auth/csrf-token");
        let csrf = CsrfCache::new(server.clone(), endpoints.clone(), Duration::from_secs(600));
        let lifecycle = SessionLifecycle::new(store.clone(), csrf);
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            server.clone(),
            endpoints,
            timeout,
        );
        Harness {
            coordinator,
            store,
            lifecycle,
            server,
        }
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_call() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_millis(50),
                ..Default::default()
            },
            Duration::from_secs(30),
        );
        let mut events = h.lifecycle.subscribe();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh(RefreshReason::Unauthorized).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.server.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.refresh_count(), 1);
        assert_eq!(h.coordinator.state(), RefreshState::Idle);

        let stored = h.store.get().unwrap().unwrap();
        assert_eq!(stored.access_token, "a2");
        assert_eq!(stored.refresh_token, "r2");
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Refreshed);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_rotate() {
        let h = harness(RefreshServer::default(), Duration::from_secs(30));

        h.coordinator.refresh(RefreshReason::Manual).await.unwrap();
        h.coordinator.refresh(RefreshReason::Manual).await.unwrap();

        assert_eq!(h.coordinator.refresh_count(), 2);
        assert_eq!(h.store.get().unwrap().unwrap().refresh_token, "r3");
    }

    #[tokio::test]
    async fn test_failure_rejects_all_and_logs_out() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_millis(30),
                fail: true,
                ..Default::default()
            },
            Duration::from_secs(30),
        );
        let mut events = h.lifecycle.subscribe();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh(RefreshReason::Unauthorized).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_refresh_failure());
        }

        assert_eq!(h.coordinator.refresh_count(), 1);
        assert!(h.store.get().unwrap().is_none());
        assert!(!h.lifecycle.is_authenticated());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended {
                reason: LogoutReason::RefreshFailed
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failure() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_secs(60),
                ..Default::default()
            },
            Duration::from_secs(30),
        );

        let err = h.coordinator.refresh(RefreshReason::Unauthorized).await.unwrap_err();
        assert!(err.is_refresh_failure());
        assert!(err.to_string().contains("timed out"));
        assert!(h.store.get().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_after_skips_when_already_rotated() {
        let h = harness(RefreshServer::default(), Duration::from_secs(30));

        // Token on the failed request is stale relative to the store.
        h.coordinator
            .refresh_after("a0", RefreshReason::Unauthorized)
            .await
            .unwrap();
        assert_eq!(h.coordinator.refresh_count(), 0);

        // Token matches the store: a real refresh.
        h.coordinator
            .refresh_after("a1", RefreshReason::Unauthorized)
            .await
            .unwrap();
        assert_eq!(h.coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_no_stored_session_fails() {
        let h = harness(RefreshServer::default(), Duration::from_secs(30));
        h.store.clear().unwrap();

        let err = h.coordinator.refresh(RefreshReason::Manual).await.unwrap_err();
        assert!(err.is_refresh_failure());
        assert_eq!(h.coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_rejects_waiters_and_discards_result() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_millis(100),
                ..Default::default()
            },
            Duration::from_secs(30),
        );
        let mut events = h.lifecycle.subscribe();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh(RefreshReason::Unauthorized).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.coordinator.state(), RefreshState::Refreshing { waiters: 3 });

        assert_eq!(h.coordinator.cancel(), 3);
        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        }

        // Let the network call land; nothing may be written.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.store.get().unwrap().unwrap().refresh_token, "r1");
        assert!(events.try_recv().is_err());
        assert_eq!(h.coordinator.state(), RefreshState::Cancelled);
    }

    #[tokio::test]
    async fn test_session_ended_during_refresh_keeps_store_empty() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_millis(100),
                ..Default::default()
            },
            Duration::from_secs(30),
        );
        let mut events = h.lifecycle.subscribe();

        let coordinator = h.coordinator.clone();
        let handle =
            tokio::spawn(async move { coordinator.refresh(RefreshReason::Unauthorized).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Ended from outside the coordinator, which is left open.
        assert!(h.lifecycle.force_logout(LogoutReason::Unauthorized));

        assert!(handle.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(h.server.calls.load(Ordering::SeqCst), 1);
        assert!(h.store.get().unwrap().is_none());
        assert_eq!(h.coordinator.state(), RefreshState::Idle);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended {
                reason: LogoutReason::Unauthorized
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_failure_does_not_end_replacement_session() {
        let h = harness(
            RefreshServer {
                delay: Duration::from_millis(100),
                fail: true,
                ..Default::default()
            },
            Duration::from_secs(30),
        );

        let coordinator = h.coordinator.clone();
        let handle =
            tokio::spawn(async move { coordinator.refresh(RefreshReason::Unauthorized).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let replacement = Session::new("b1", "s1", Utc::now() + chrono::Duration::minutes(15));
        h.lifecycle.establish(&replacement).unwrap();

        assert!(handle.await.unwrap().unwrap_err().is_refresh_failure());
        assert!(h.lifecycle.is_authenticated());
        assert_eq!(h.store.get().unwrap().unwrap().access_token, "b1");
    }

    #[tokio::test]
    async fn test_cancelled_until_rearmed() {
        let h = harness(RefreshServer::default(), Duration::from_secs(30));

        h.coordinator.cancel();
        assert!(h
            .coordinator
            .refresh(RefreshReason::Manual)
            .await
            .unwrap_err()
            .is_cancelled());
        assert_eq!(h.coordinator.refresh_count(), 0);

        h.coordinator.rearm();
        h.coordinator.refresh(RefreshReason::Manual).await.unwrap();
        assert_eq!(h.coordinator.refresh_count(), 1);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(RefreshReason::Unauthorized.to_string(), "401");
        assert_eq!(RefreshReason::Expired.to_string(), "expired");
    }
}
