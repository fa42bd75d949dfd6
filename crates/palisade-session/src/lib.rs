//! Client-side session resilience for token-authenticated HTTP APIs.
//!
//! Every request goes through one pipeline that attaches the bearer token
//! and, for state-changing calls, an anti-forgery token. When the server
//! answers 401 the pipeline refreshes the token pair and replays the request
//! once. However many requests fail at the same moment, exactly one refresh
//! call is made; everyone else waits for it and replays with its result.
//! When recovery is impossible the session is cleared and the host
//! application is told through a [`SessionEvent::Ended`] notification.
//!
//! # Example
//!
//! ```no_run
//! use palisade_session::{FileTokenStore, Result, SessionClient, SessionEvent};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let client = SessionClient::builder()
//!     .base_url("https://api.example.com")
//!     .token_store(Arc::new(FileTokenStore::new("/tmp/palisade".as_ref())))
//!     .build()?;
//! client.init();
//!
//! let mut events = client.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let SessionEvent::Ended { reason } = event {
//!             println!("Session ended ({}); please log in again", reason);
//!         }
//!     }
//! });
//!
//! let profile: serde_json::Value = client.get_json("/me").await?;
//! println!("{}", profile);
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`store`]: durable holder of the current token pair
//! - [`csrf`]: time-boxed anti-forgery token cache
//! - [`lifecycle`]: logged-in state, forced logout and session events
//! - [`refresh`]: single-flight refresh coordinator
//! - [`pipeline`]: credential attachment, 401 recovery and error normalization
//! - [`transport`]: request descriptors and the HTTP seam

pub mod auth;
pub mod client;
pub mod config;
pub mod csrf;
pub mod error;
mod flight;
pub mod lifecycle;
pub mod pipeline;
pub mod refresh;
pub mod session;
pub mod store;
pub mod transport;

pub use auth::AuthEndpoints;
pub use client::{ClientBuilder, SessionClient};
pub use config::SessionConfig;
pub use csrf::{CsrfCache, CsrfToken};
pub use error::{Error, Result, StorageError};
pub use lifecycle::{LogoutReason, SessionEvent, SessionLifecycle};
pub use pipeline::{Attempt, RequestPipeline};
pub use refresh::{RefreshCoordinator, RefreshReason, RefreshState};
pub use session::Session;
pub use store::{FileTokenStore, MemoryTokenStore, SharedTokenStore, TokenStore};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, RequestBody, Transport};
