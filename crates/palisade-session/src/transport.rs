//! Request descriptors and the network seam.
//!
//! [`ApiRequest`] is an immutable description of one call. The pipeline may
//! dispatch the same descriptor twice (initial attempt and one replay after a
//! refresh), each time with freshly resolved credential headers, so nothing
//! about an attempt is ever written back into the request.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use url::Url;

use crate::config::SessionConfig;
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Request / response
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of an [`ApiRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Bytes,
    },
    /// Single-file multipart upload.
    Upload {
        field: String,
        file_name: String,
        content_type: String,
        data: Bytes,
    },
}

/// Immutable descriptor of one outgoing call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Multipart upload of a single file (sent as POST).
    pub fn upload(
        path: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::post(path).with_body(RequestBody::Upload {
            field: "file".to_string(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        })
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_json<B: serde::Serialize + ?Sized>(self, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)?;
        Ok(self.with_body(RequestBody::Json(value)))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a caller-supplied header. Credential headers set by the pipeline
    /// take precedence over these.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Whether this call must carry an anti-forgery token.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        ) || matches!(self.body, RequestBody::Upload { .. })
    }
}

impl fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// A response as received, success or not.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Convenience for JSON bodies.
    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as UTF-8 text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Normalize a non-success response into an [`Error`].
    pub fn error(&self) -> Error {
        Error::from_response(self.status, &self.body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatches requests to the server.
///
/// Implementations return `Ok` for every response that arrived, whatever its
/// status, and `Err(Error::Network)` only when no response was received.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `request` with `headers` layered over the request's own headers.
    async fn execute(&self, request: &ApiRequest, headers: HeaderMap) -> Result<ApiResponse>;
}

/// [`Transport`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from configuration.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        // Parse and normalize base URL
        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("palisade-session/{}", env!("CARGO_PKG_VERSION")));

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            timeout: config.request_timeout,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a URL for a request path.
    pub(crate) fn url(&self, path: &str) -> Result<Url> {
        let path = path.trim_start_matches('/');
        self.base_url.join(path).map_err(Error::from)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ApiRequest, headers: HeaderMap) -> Result<ApiResponse> {
        let url = self.url(request.path())?;

        let mut builder = self
            .http
            .request(request.method().clone(), url)
            .timeout(self.timeout)
            .headers(request.headers().clone())
            .headers(headers);

        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }

        builder = match request.body() {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { content_type, data } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            RequestBody::Upload {
                field,
                file_name,
                content_type,
                data,
            } => {
                let part = reqwest::multipart::Part::bytes(data.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(content_type)
                    .map_err(|e| Error::Config(format!("invalid upload content type: {}", e)))?;
                builder.multipart(reqwest::multipart::Form::new().part(field.clone(), part))
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        tracing::trace!(request = %request, status, "Response received");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
