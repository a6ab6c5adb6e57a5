//! REST backend client.
//!
//! Provides authenticated HTTP communication with the POS backend for the
//! entity bindings and the queue drainer, plus the lightweight health probe
//! that drives the connectivity flag.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::entities::EntityKind;
use crate::envelope::{unwrap_envelope, Unwrapped};
use crate::error::ApiError;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Percent-encode a single path segment (ids may contain anything).
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a typed, user-friendly error.
pub(crate) fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return ApiError::Unreachable(format!("Cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return ApiError::Config(format!("Invalid backend URL: {url}"));
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Fallback message for an HTTP status without a usable body.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session is invalid or expired".to_string(),
        403 => "Not authorized for this operation".to_string(),
        404 => "Resource not found".to_string(),
        409 => "Conflicting change on the server".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Build an `ApiError::Http`, preserving validation details from the body.
pub(crate) fn http_error(status: StatusCode, body_text: &str) -> ApiError {
    let trimmed = body_text.trim();
    let message = if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message}: {details}"),
            None => message,
        }
    } else if !trimmed.is_empty() {
        format!("{}: {trimmed}", status_error(status))
    } else {
        status_error(status)
    };
    ApiError::Http {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityResult {
    fn failed(latency_ms: Option<u64>, error: String) -> Self {
        Self {
            success: false,
            latency_ms,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote seam
// ---------------------------------------------------------------------------

/// Remote operations the bindings and the queue drainer dispatch to.
///
/// All successful bodies are already envelope-normalised.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, kind: EntityKind, data: &Value) -> Result<Value, ApiError>;
    async fn update(&self, kind: EntityKind, id: &str, data: &Value) -> Result<Value, ApiError>;
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError>;
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError>;
    async fn list(&self, kind: EntityKind, query: &[(String, String)])
        -> Result<Unwrapped, ApiError>;
    async fn health(&self) -> ConnectivityResult;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Authenticated client for the POS REST backend.
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_token: Option<Zeroizing<String>>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(ApiError::Config("API base URL is not configured".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: Option<Zeroizing<String>>) -> Self {
        self.auth_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request and return the raw JSON body, or
    /// `null` for empty 204 responses.
    ///
    /// `path` should include the leading slash, e.g. `/products/42`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %full_url, "backend request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token.as_str());
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            return Err(http_error(status, &body_text));
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid JSON from backend: {e}")))
    }

    async fn request_data(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let raw = self.request(method, path, &[], body).await?;
        Ok(unwrap_envelope(raw)?.data)
    }

    fn item_path(kind: EntityKind, id: &str) -> String {
        format!("{}/{}", kind.resource_path(), percent_encode(id))
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn create(&self, kind: EntityKind, data: &Value) -> Result<Value, ApiError> {
        self.request_data(Method::POST, kind.resource_path(), Some(data))
            .await
    }

    async fn update(&self, kind: EntityKind, id: &str, data: &Value) -> Result<Value, ApiError> {
        self.request_data(Method::PUT, &Self::item_path(kind, id), Some(data))
            .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError> {
        self.request_data(Method::DELETE, &Self::item_path(kind, id), None)
            .await
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError> {
        self.request_data(Method::GET, &Self::item_path(kind, id), None)
            .await
    }

    async fn list(
        &self,
        kind: EntityKind,
        query: &[(String, String)],
    ) -> Result<Unwrapped, ApiError> {
        let raw = self
            .request(Method::GET, kind.resource_path(), query, None)
            .await?;
        unwrap_envelope(raw)
    }

    /// Test connectivity to the backend with a lightweight health-check.
    async fn health(&self) -> ConnectivityResult {
        let health_url = format!("{}/health", self.base_url);
        let start = Instant::now();

        let resp = match self
            .client
            .get(&health_url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult::failed(
                    None,
                    friendly_error(&self.base_url, &e).to_string(),
                )
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult::failed(Some(latency), status_error(status))
        }
    }
}
