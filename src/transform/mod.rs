//! Provider request transformation
//!
//! Normalizes a client body into the envelope a provider expects and builds
//! the outgoing headers. Transformers are pure: (body, account) in, new
//! (body, headers, path) out. Retry-driven downgrades are expressed as an
//! explicit stage so the controller can walk them one at a time.

pub mod antigravity;
pub mod anthropic;
pub mod codex;

use reqwest::header::HeaderMap;
use serde_json::Value;

/// Progressive degradation applied when Antigravity rejects signed thinking
/// blocks. Stages are tried in order, once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DowngradeStage {
    #[default]
    None,
    /// Disable top-level thinking and flatten thinking blocks to text.
    DisableThinking,
    /// Additionally convert tool_use/tool_result blocks to text.
    ToolsToText,
}

impl DowngradeStage {
    /// Next stage, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            DowngradeStage::None => Some(DowngradeStage::DisableThinking),
            DowngradeStage::DisableThinking => Some(DowngradeStage::ToolsToText),
            DowngradeStage::ToolsToText => None,
        }
    }
}

/// A provider-ready request: body, headers, and the path appended to the
/// base URL.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub body: Value,
    pub headers: HeaderMap,
    pub path: String,
}

/// Native Gemini passthrough: key or bearer auth plus the per-model action
/// path; the body is forwarded as received.
pub fn gemini_native(
    credential: &str,
    use_api_key: bool,
    payload: &Value,
    model: &str,
    stream: bool,
) -> crate::error::GatewayResult<TransformedRequest> {
    use reqwest::header::HeaderValue;

    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("application/json"),
    );
    let value = if use_api_key {
        HeaderValue::from_str(credential)
    } else {
        HeaderValue::from_str(&format!("Bearer {}", credential))
    }
    .map_err(|_| crate::error::GatewayError::UpstreamAuth("credential is not header-safe".into()))?;
    headers.insert(if use_api_key { "x-goog-api-key" } else { "authorization" }, value);

    let action = if stream {
        format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
    } else {
        format!("/v1beta/models/{}:generateContent", model)
    };

    Ok(TransformedRequest {
        body: payload.clone(),
        headers,
        path: action,
    })
}

/// Sora passthrough: bearer auth onto the video endpoint.
pub fn sora(credential: &str, payload: &Value) -> crate::error::GatewayResult<TransformedRequest> {
    use reqwest::header::HeaderValue;

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", credential)).map_err(|_| {
            crate::error::GatewayError::UpstreamAuth("credential is not header-safe".into())
        })?,
    );

    Ok(TransformedRequest {
        body: payload.clone(),
        headers,
        path: "/v1/videos".to_string(),
    })
}

/// Keep only the listed top-level fields.
pub(crate) fn filter_payload(payload: &Value, allowed: &[&str]) -> Value {
    if let Some(obj) = payload.as_object() {
        let filtered: serde_json::Map<String, Value> = obj
            .iter()
            .filter(|(key, _)| allowed.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(filtered)
    } else {
        payload.clone()
    }
}

/// Coerce a sloppy `stream` flag to a real boolean; returns the value.
pub(crate) fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };

    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };

    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }

    is_streaming
}

/// Remove `cache_control` wherever it appears in the tree.
pub(crate) fn strip_cache_control(value: &mut Value) {
    match value {
        Value::Object(obj) => {
            obj.remove("cache_control");
            for (_, v) in obj.iter_mut() {
                strip_cache_control(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_cache_control(item);
            }
        }
        _ => {}
    }
}

/// Whether the client body asks for extended thinking.
pub(crate) fn is_thinking_enabled(payload: &Value) -> bool {
    let Some(thinking) = payload.get("thinking") else {
        return false;
    };
    match thinking.get("type").and_then(|t| t.as_str()) {
        Some("enabled") => true,
        Some(_) => false,
        None => thinking.get("budget_tokens").is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_downgrade_stage_progression() {
        assert_eq!(DowngradeStage::None.next(), Some(DowngradeStage::DisableThinking));
        assert_eq!(
            DowngradeStage::DisableThinking.next(),
            Some(DowngradeStage::ToolsToText)
        );
        assert_eq!(DowngradeStage::ToolsToText.next(), None);
    }

    #[test]
    fn test_filter_payload() {
        let payload = json!({"model": "m", "messages": [], "secret": 1});
        let filtered = filter_payload(&payload, &["model", "messages"]);
        assert!(filtered.get("secret").is_none());
        assert!(filtered.get("model").is_some());
    }

    #[test]
    fn test_normalize_stream_flag_variants() {
        for (raw, expected) in [
            (json!({"stream": true}), true),
            (json!({"stream": "true"}), true),
            (json!({"stream": 1}), true),
            (json!({"stream": "off"}), false),
            (json!({}), false),
        ] {
            let mut payload = raw;
            assert_eq!(normalize_stream_flag(&mut payload), expected);
        }
    }

    #[test]
    fn test_strip_cache_control_recurses() {
        let mut payload = json!({
            "system": [{"type": "text", "text": "x", "cache_control": {"type": "ephemeral"}}],
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "y", "cache_control": {}}]}
            ]
        });
        strip_cache_control(&mut payload);
        assert!(payload["system"][0].get("cache_control").is_none());
        assert!(payload["messages"][0]["content"][0].get("cache_control").is_none());
    }

    #[test]
    fn test_is_thinking_enabled() {
        assert!(is_thinking_enabled(&json!({"thinking": {"type": "enabled", "budget_tokens": 1024}})));
        assert!(is_thinking_enabled(&json!({"thinking": {"budget_tokens": 1024}})));
        assert!(!is_thinking_enabled(&json!({"thinking": {"type": "disabled"}})));
        assert!(!is_thinking_enabled(&json!({})));
    }
}
