//! HTTP upstream capability
//!
//! One logical HTTP call per invocation, with proxy dialing and per-account
//! concurrency enforced inside the capability. The retry controller treats
//! it as opaque: it hands over a prepared request and receives a status,
//! headers and a byte stream.

pub mod urls;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Proxy};
use serde_json::Value;

use crate::config;
use crate::error::{GatewayError, GatewayResult};
use crate::limits::{ConcurrencyGuard, ConcurrencyLimiter};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A fully prepared upstream attempt.
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub timeout: Duration,
    /// Per-account proxy override; falls back to the global proxy config.
    pub proxy_url: Option<String>,
    pub account_id: u64,
    pub account_concurrency: u32,
    pub tls_fingerprint: bool,
}

impl UpstreamRequest {
    pub fn post(url: &str, headers: HeaderMap, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.to_string(),
            headers,
            body: Some(body),
            timeout: Duration::from_secs(300),
            proxy_url: None,
            account_id: 0,
            account_concurrency: 0,
            tls_fingerprint: false,
        }
    }
}

/// What came back from one attempt. Dropping the response releases the
/// account's concurrency slot.
pub struct AttemptResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
    _permit: Option<ConcurrencyGuard>,
}

impl AttemptResponse {
    /// Build from a literal body (tests and fakes).
    pub fn from_text(status: u16, body: &str) -> Self {
        let bytes = Bytes::from(body.to_string());
        Self::from_stream(
            status,
            Box::pin(futures_util::stream::once(async move { Ok(bytes) })),
        )
    }

    /// Build from an arbitrary byte stream.
    pub fn from_stream(status: u16, body: ByteStream) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
            _permit: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body into a string; used on error paths and non-stream
    /// collection of small payloads.
    pub async fn collect_text(mut self) -> GatewayResult<(u16, HeaderMap, String)> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::Connection(format!("body read failed: {}", e)))?;
            out.extend_from_slice(&chunk);
        }
        Ok((
            self.status,
            self.headers,
            String::from_utf8_lossy(&out).to_string(),
        ))
    }
}

/// The capability the controller calls; implementations own proxying, TLS
/// concerns and the per-account concurrency slot.
#[async_trait]
pub trait HttpUpstream: Send + Sync {
    async fn issue(&self, request: UpstreamRequest) -> GatewayResult<AttemptResponse>;
}

fn normalize_proxy_url(raw: &str, default_scheme: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", default_scheme, trimmed)
    }
}

fn build_proxy(proxy_url: Option<&str>) -> Option<Proxy> {
    if let Some(url) = proxy_url.filter(|u| !u.trim().is_empty()) {
        return Proxy::all(normalize_proxy_url(url, "http")).ok();
    }

    let cfg = config::load();
    let proxy_cfg = cfg.proxy.as_ref()?;
    if !proxy_cfg.enabled {
        return None;
    }
    let url = proxy_cfg.url.as_deref()?.trim();
    if url.is_empty() {
        crate::logger::warn("upstream", "Proxy enabled but no URL configured, ignoring proxy");
        return None;
    }
    let mut proxy = Proxy::all(normalize_proxy_url(url, "http")).ok()?;
    if let (Some(username), Some(password)) = (&proxy_cfg.username, &proxy_cfg.password) {
        proxy = proxy.basic_auth(username, password);
    }
    if let Some(bypass) = proxy_cfg.bypass.as_ref() {
        if let Some(no_proxy) = reqwest::NoProxy::from_string(&bypass.join(",")) {
            proxy = proxy.no_proxy(Some(no_proxy));
        }
    }
    Some(proxy)
}

/// Default capability over reqwest. A client is built per call so proxy and
/// timeout follow the account, not a shared pool.
pub struct ReqwestUpstream {
    limiter: ConcurrencyLimiter,
}

impl ReqwestUpstream {
    pub fn new(limiter: ConcurrencyLimiter) -> Self {
        Self { limiter }
    }

    fn build_client(&self, request: &UpstreamRequest) -> GatewayResult<Client> {
        let mut builder = Client::builder()
            .timeout(request.timeout)
            .connect_timeout(Duration::from_secs(10));

        if let Some(proxy) = build_proxy(request.proxy_url.as_deref()) {
            builder = builder.proxy(proxy);
        }

        // TLS fingerprint emulation is an external concern; the flag only
        // selects connection reuse off so a dedicated dialer can wrap us.
        if request.tls_fingerprint {
            builder = builder.pool_max_idle_per_host(0);
        }

        builder
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))
    }
}

#[async_trait]
impl HttpUpstream for ReqwestUpstream {
    async fn issue(&self, request: UpstreamRequest) -> GatewayResult<AttemptResponse> {
        let permit = self
            .limiter
            .acquire(request.account_id, request.account_concurrency);
        if permit.is_none() && request.account_concurrency != 0 {
            return Err(GatewayError::Internal(format!(
                "account {} concurrency exhausted",
                request.account_id
            )));
        }

        let client = self.build_client(&request)?;
        crate::logger::debug(
            "upstream",
            &format!("{} {} (account {})", request.method, request.url, request.account_id),
        );

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("upstream request timed out: {}", e))
            } else if e.is_connect() {
                GatewayError::Connection(format!("connection failed: {}", e))
            } else {
                GatewayError::Connection(format!("request error: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string()))),
        );

        Ok(AttemptResponse {
            status,
            headers,
            body,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_proxy_url() {
        assert_eq!(normalize_proxy_url("127.0.0.1:8080", "http"), "http://127.0.0.1:8080");
        assert_eq!(
            normalize_proxy_url("socks5://127.0.0.1:1080", "http"),
            "socks5://127.0.0.1:1080"
        );
        assert_eq!(
            normalize_proxy_url("  http://proxy  ", "http"),
            "http://proxy"
        );
    }

    #[tokio::test]
    async fn test_attempt_response_collect_text() {
        let resp = AttemptResponse::from_text(200, "hello");
        assert!(resp.is_success());
        let (status, _headers, text) = resp.collect_text().await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_from_text_status_classes() {
        assert!(!AttemptResponse::from_text(429, "limited").is_success());
        assert!(AttemptResponse::from_text(204, "").is_success());
    }
}
