//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde_json::json;

use palisade_session::{
    ApiRequest, ApiResponse, MemoryTokenStore, RequestBody, Result, Session, SessionClient,
    SessionConfig, SharedTokenStore, Transport,
};

/// A request as seen by the backend.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub csrf: Option<String>,
}

#[derive(Debug)]
struct Tokens {
    generation: usize,
    /// `None` once the access token has been expired server-side.
    access: Option<String>,
    refresh: String,
    csrf_issued: HashSet<String>,
}

/// In-process stand-in for the API server and its auth endpoints.
///
/// Issues `access-N` / `refresh-N` pairs, rotating on every successful
/// refresh, and refuses any refresh token that is not the current one.
#[derive(Debug)]
pub struct FakeBackend {
    tokens: Mutex<Tokens>,
    refresh_delay: Mutex<Duration>,
    refresh_fails: Mutex<bool>,
    always_unauthorized: Mutex<HashSet<String>>,
    path_delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<Recorded>>,
    refresh_calls: AtomicUsize,
    csrf_fetches: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(Tokens {
                generation: 1,
                access: Some("access-1".to_string()),
                refresh: "refresh-1".to_string(),
                csrf_issued: HashSet::new(),
            }),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_fails: Mutex::new(false),
            always_unauthorized: Mutex::new(HashSet::new()),
            path_delays: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            csrf_fetches: AtomicUsize::new(0),
        })
    }

    /// Stop accepting the current access token.
    pub fn expire_access(&self) {
        self.tokens.lock().access = None;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    pub fn fail_refresh(&self) {
        *self.refresh_fails.lock() = true;
    }

    /// Answer 401 on `path` whatever the credentials.
    pub fn always_unauthorized(&self, path: &str) {
        self.always_unauthorized.lock().insert(path.to_string());
    }

    /// Hold every response on `path` for `delay`.
    pub fn delay_path(&self, path: &str, delay: Duration) {
        self.path_delays.lock().insert(path.to_string(), delay);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn csrf_fetches(&self) -> usize {
        self.csrf_fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    async fn refresh(&self, request: &ApiRequest) -> ApiResponse {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if *self.refresh_fails.lock() {
            return unauthorized("invalid_grant", "refresh token revoked");
        }

        let presented = match request.body() {
            RequestBody::Json(body) => body["refreshToken"].as_str().map(str::to_string),
            _ => None,
        };

        let mut tokens = self.tokens.lock();
        if presented.as_deref() != Some(tokens.refresh.as_str()) {
            return unauthorized("invalid_grant", "refresh token already used");
        }

        tokens.generation += 1;
        let access = format!("access-{}", tokens.generation);
        let refresh = format!("refresh-{}", tokens.generation);
        tokens.access = Some(access.clone());
        tokens.refresh = refresh.clone();

        ApiResponse::json_body(
            200,
            &json!({
                "accessToken": access,
                "refreshToken": refresh,
                "expiresIn": 900,
                "userId": "user-1"
            }),
        )
    }

    fn csrf(&self) -> ApiResponse {
        let n = self.csrf_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("csrf-{}", n);
        self.tokens.lock().csrf_issued.insert(token.clone());
        ApiResponse::json_body(200, &json!({ "csrfToken": token }))
    }

    fn business(&self, request: &ApiRequest, headers: &HeaderMap) -> ApiResponse {
        let authorization = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let csrf = headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        self.requests.lock().push(Recorded {
            method: request.method().to_string(),
            path: request.path().to_string(),
            authorization: authorization.clone(),
            csrf: csrf.clone(),
        });

        if self.always_unauthorized.lock().contains(request.path()) {
            return unauthorized("forbidden_resource", "not allowed");
        }

        let tokens = self.tokens.lock();
        let expected = tokens.access.as_ref().map(|a| format!("Bearer {}", a));
        if authorization.is_none() || authorization != expected {
            return unauthorized("token_expired", "access token expired");
        }

        if request.is_state_changing() {
            let valid = csrf
                .as_ref()
                .is_some_and(|token| tokens.csrf_issued.contains(token));
            if !valid {
                return ApiResponse::json_body(
                    403,
                    &json!({"code": "csrf_invalid", "message": "missing CSRF token"}),
                );
            }
        }

        ApiResponse::json_body(200, &json!({ "ok": true, "path": request.path() }))
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn execute(&self, request: &ApiRequest, headers: HeaderMap) -> Result<ApiResponse> {
        let delay = self.path_delays.lock().get(request.path()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = match request.path() {
            "/auth/refresh" => self.refresh(request).await,
            "/auth/csrf-token" => self.csrf(),
            _ => self.business(request, &headers),
        };
        Ok(response)
    }
}

fn unauthorized(code: &str, message: &str) -> ApiResponse {
    ApiResponse::json_body(401, &json!({ "code": code, "message": message }))
}

/// The session the backend issued at generation 1.
pub fn initial_session() -> Session {
    Session::new(
        "access-1",
        "refresh-1",
        Utc::now() + chrono::Duration::minutes(15),
    )
    .with_user_id("user-1")
}

/// A client already logged in with [`initial_session`].
pub fn logged_in_client(backend: &Arc<FakeBackend>, config: SessionConfig) -> SessionClient {
    let store: SharedTokenStore = Arc::new(MemoryTokenStore::with_session(initial_session()));
    client_with_store(backend, config, store)
}

pub fn client_with_store(
    backend: &Arc<FakeBackend>,
    config: SessionConfig,
    store: SharedTokenStore,
) -> SessionClient {
    let client = SessionClient::builder()
        .config(config)
        .transport(backend.clone())
        .token_store(store)
        .build()
        .expect("client builds");
    client.init();
    client
}
