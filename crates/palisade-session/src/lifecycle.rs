//! Logged-in state and forced logout.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::csrf::CsrfCache;
use crate::error::{Result, StorageError};
use crate::session::Session;
use crate::store::SharedTokenStore;

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user asked to log out.
    UserInitiated,
    /// The refresh endpoint failed or timed out.
    RefreshFailed,
    /// A request was still rejected with 401 after refreshing.
    Unauthorized,
    /// The stored session could not be used at startup.
    InvalidStoredSession,
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogoutReason::UserInitiated => "user_initiated",
            LogoutReason::RefreshFailed => "refresh_failed",
            LogoutReason::Unauthorized => "unauthorized",
            LogoutReason::InvalidStoredSession => "invalid_stored_session",
        };
        f.write_str(s)
    }
}

/// Notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created by login, registration or SSO.
    Established { user_id: Option<String> },
    /// The token pair was rotated by a refresh.
    Refreshed,
    /// The session is gone; the host should show its login surface.
    Ended { reason: LogoutReason },
}

/// Owns the "are we logged in" flag and the one way of ending a session.
///
/// Every session change bumps an epoch under a mutex. A refresh records the
/// epoch it read its refresh token under and may only write its rotated pair
/// while that epoch is still current, so a refresh that outlives a logout or
/// a new login can never bring the old session back.
pub struct SessionLifecycle {
    store: SharedTokenStore,
    csrf: CsrfCache,
    authenticated: AtomicBool,
    epoch: Mutex<u64>,
    events: broadcast::Sender<SessionEvent>,
}

impl fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl SessionLifecycle {
    /// Start out authenticated iff the store already holds a session.
    pub fn new(store: SharedTokenStore, csrf: CsrfCache) -> Arc<Self> {
        let authenticated = matches!(store.get(), Ok(Some(_)));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            csrf,
            authenticated: AtomicBool::new(authenticated),
            epoch: Mutex::new(0),
            events,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Receive [`SessionEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Install a session obtained by login, registration or SSO.
    pub fn establish(&self, session: &Session) -> Result<()> {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.store.set(session)?;
        self.csrf.clear();
        self.authenticated.store(true, Ordering::SeqCst);
        info!(user_id = ?session.user_id, "Session established");
        self.emit(SessionEvent::Established {
            user_id: session.user_id.clone(),
        });
        Ok(())
    }

    /// Validate the stored session at startup.
    ///
    /// An unreadable or malformed stored session is destroyed through
    /// [`force_logout`](Self::force_logout). An expired access token is kept:
    /// the refresh token may still be good.
    pub fn restore(&self) -> Option<Session> {
        match self.store.get() {
            Ok(Some(session)) if session.is_well_formed() => {
                self.authenticated.store(true, Ordering::SeqCst);
                info!(
                    user_id = ?session.user_id,
                    expired = session.is_expired(),
                    "Restored stored session"
                );
                Some(session)
            }
            Ok(Some(_)) => {
                warn!("Stored session is malformed");
                self.invalidate_stored();
                None
            }
            Ok(None) => {
                self.authenticated.store(false, Ordering::SeqCst);
                None
            }
            Err(e) => {
                warn!(error = %e, "Stored session unreadable");
                self.invalidate_stored();
                None
            }
        }
    }

    fn invalidate_stored(&self) {
        self.force_logout(LogoutReason::InvalidStoredSession);
    }

    /// End the session: clear tokens and the CSRF cache, mark the
    /// application unauthenticated and emit one [`SessionEvent::Ended`].
    ///
    /// Any refresh still on the wire loses the right to store its result.
    ///
    /// Idempotent. Returns `true` only for the call that actually ended the
    /// session, which is the first call made while the application was
    /// authenticated or anything was stored.
    pub fn force_logout(&self, reason: LogoutReason) -> bool {
        let mut epoch = self.epoch.lock();
        self.end(&mut epoch, reason)
    }

    /// [`force_logout`](Self::force_logout) on behalf of a refresh that read
    /// its token under `epoch`. No effect once the session it was refreshing
    /// has been ended or replaced.
    pub(crate) fn force_logout_if_current(&self, epoch: u64, reason: LogoutReason) -> bool {
        let mut current = self.epoch.lock();
        if *current != epoch {
            debug!(%reason, "Session already replaced; ignoring stale logout");
            return false;
        }
        self.end(&mut current, reason)
    }

    fn end(&self, epoch: &mut u64, reason: LogoutReason) -> bool {
        *epoch += 1;

        let was_authenticated = self.authenticated.swap(false, Ordering::SeqCst);
        let has_stored = !matches!(self.store.get(), Ok(None));
        if !was_authenticated && !has_stored {
            return false;
        }

        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        self.csrf.clear();

        info!(%reason, "Session ended");
        self.emit(SessionEvent::Ended { reason });
        true
    }

    /// The current epoch together with the stored session, read atomically.
    pub(crate) fn load(&self) -> (u64, std::result::Result<Option<Session>, StorageError>) {
        let epoch = self.epoch.lock();
        (*epoch, self.store.get())
    }

    /// Store a refreshed pair obtained under `epoch` and emit
    /// [`SessionEvent::Refreshed`].
    ///
    /// Returns `Ok(false)` without writing when the session has been ended or
    /// replaced since.
    pub(crate) fn commit_refreshed(&self, epoch: u64, session: &Session) -> Result<bool> {
        let current = self.epoch.lock();
        if *current != epoch {
            return Ok(false);
        }
        self.store.set(session)?;
        self.emit(SessionEvent::Refreshed);
        Ok(true)
    }

    /// Revoke the right of any running refresh to store its result, without
    /// touching the session.
    pub(crate) fn supersede_refreshes(&self) {
        *self.epoch.lock() += 1;
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
