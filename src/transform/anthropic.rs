//! Anthropic passthrough
//!
//! API-key accounts forward the body as-is. Inbound auth is replaced with
//! the account's key, cookies and cross-provider keys are stripped, and the
//! version header is pinned.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

use super::{normalize_stream_flag, TransformedRequest};

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Inbound headers never forwarded upstream: client auth, cookies, and keys
/// that belong to other providers.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "x-goog-api-key",
    "openai-api-key",
    "openai-organization",
    "host",
    "content-length",
];

/// Client headers forwarded verbatim when present.
const FORWARDED_HEADERS: &[&str] = &["anthropic-beta", "x-app", "user-agent"];

pub fn prepare(
    api_key: &str,
    payload: &Value,
    client_headers: &HeaderMap,
) -> GatewayResult<TransformedRequest> {
    if payload.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Err(GatewayError::InvalidRequest("empty request body".into()));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-api-key",
        HeaderValue::from_str(api_key)
            .map_err(|_| GatewayError::UpstreamAuth("API key is not header-safe".into()))?,
    );
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    for name in FORWARDED_HEADERS {
        if let Some(value) = client_headers.get(*name) {
            if let Ok(parsed) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(parsed, value.clone());
            }
        }
    }

    debug_assert!(STRIPPED_HEADERS
        .iter()
        .all(|name| !FORWARDED_HEADERS.contains(name)));

    let mut body = payload.clone();
    normalize_stream_flag(&mut body);

    Ok(TransformedRequest {
        body,
        headers,
        path: "/v1/messages".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer client-key"));
        h.insert("cookie", HeaderValue::from_static("session=abc"));
        h.insert("x-goog-api-key", HeaderValue::from_static("goog"));
        h.insert("anthropic-beta", HeaderValue::from_static("prompt-caching-2024-07-31"));
        h.insert("user-agent", HeaderValue::from_static("claude-cli/1.0.83"));
        h
    }

    #[test]
    fn test_replaces_auth_and_pins_version() {
        let req = prepare(
            "sk-ant-account",
            &json!({"model": "claude-sonnet-4-5", "messages": []}),
            &client_headers(),
        )
        .unwrap();

        assert_eq!(req.headers.get("x-api-key").unwrap(), "sk-ant-account");
        assert_eq!(req.headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(req.headers.get("authorization").is_none());
        assert!(req.headers.get("cookie").is_none());
        assert!(req.headers.get("x-goog-api-key").is_none());
        assert_eq!(req.path, "/v1/messages");
    }

    #[test]
    fn test_forwards_beta_and_user_agent() {
        let req = prepare(
            "sk-ant-account",
            &json!({"model": "m", "messages": []}),
            &client_headers(),
        )
        .unwrap();
        assert_eq!(
            req.headers.get("anthropic-beta").unwrap(),
            "prompt-caching-2024-07-31"
        );
        assert_eq!(req.headers.get("user-agent").unwrap(), "claude-cli/1.0.83");
    }

    #[test]
    fn test_body_preserved() {
        let payload = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": "true",
            "metadata": {"user_id": "u"}
        });
        let req = prepare("k", &payload, &HeaderMap::new()).unwrap();
        assert_eq!(req.body["metadata"]["user_id"], "u");
        // Sloppy stream flags are normalized, nothing else changes.
        assert_eq!(req.body["stream"], json!(true));
    }

    #[test]
    fn test_empty_body_rejected() {
        assert!(prepare("k", &json!({}), &HeaderMap::new()).is_err());
    }
}
