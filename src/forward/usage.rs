//! Usage accounting
//!
//! One shared record populated from non-stream responses and SSE events
//! alike. Downstream billing reads it; the core only collects. The merge
//! rules protect against providers that repeat usage with zeroed fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    /// Five-minute ephemeral cache-creation split.
    pub cache_creation_5m_tokens: i64,
    /// One-hour ephemeral cache-creation split.
    pub cache_creation_1h_tokens: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    /// Merge a later observation into this one. Non-zero values win; a zero
    /// in `other` never erases something we already saw (providers repeat
    /// usage objects with missing fields in `message_delta`).
    pub fn merge(&mut self, other: &Usage) {
        fn keep(current: &mut i64, incoming: i64) {
            if incoming != 0 {
                *current = incoming;
            }
        }
        keep(&mut self.input_tokens, other.input_tokens);
        keep(&mut self.output_tokens, other.output_tokens);
        keep(&mut self.cache_creation_tokens, other.cache_creation_tokens);
        keep(&mut self.cache_read_tokens, other.cache_read_tokens);
        keep(
            &mut self.cache_creation_5m_tokens,
            other.cache_creation_5m_tokens,
        );
        keep(
            &mut self.cache_creation_1h_tokens,
            other.cache_creation_1h_tokens,
        );
    }
}

fn get_i64(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

/// Parse a provider `usage` object (Anthropic or OpenAI field names, plus
/// the cache fallbacks).
pub fn parse_usage_object(usage: &Value) -> Usage {
    let input_tokens = match get_i64(usage, "input_tokens") {
        0 => get_i64(usage, "prompt_tokens"),
        v => v,
    };
    let output_tokens = match get_i64(usage, "output_tokens") {
        0 => get_i64(usage, "completion_tokens"),
        v => v,
    };

    // `cached_tokens` (OpenAI detail) stands in for cache_read when the
    // Anthropic field is absent.
    let cache_read_tokens = match get_i64(usage, "cache_read_input_tokens") {
        0 => usage
            .get("prompt_tokens_details")
            .map(|d| get_i64(d, "cached_tokens"))
            .unwrap_or(0),
        v => v,
    };

    let mut cache_creation_tokens = get_i64(usage, "cache_creation_input_tokens");
    let mut cache_creation_5m_tokens = 0;
    let mut cache_creation_1h_tokens = 0;
    if let Some(detail) = usage.get("cache_creation") {
        cache_creation_5m_tokens = get_i64(detail, "ephemeral_5m_input_tokens");
        cache_creation_1h_tokens = get_i64(detail, "ephemeral_1h_input_tokens");
        // The split sums into the aggregate when the aggregate is missing.
        if cache_creation_tokens == 0 {
            cache_creation_tokens = cache_creation_5m_tokens + cache_creation_1h_tokens;
        }
    }

    Usage {
        input_tokens,
        output_tokens,
        cache_creation_tokens,
        cache_read_tokens,
        cache_creation_5m_tokens,
        cache_creation_1h_tokens,
    }
}

/// Pull usage out of one SSE event or response body, wherever the provider
/// put it.
pub fn extract_usage(payload: &Value) -> Option<Usage> {
    if let Some(usage) = payload.get("usage") {
        return Some(parse_usage_object(usage));
    }
    // Anthropic message_start nests usage inside the message.
    if let Some(usage) = payload.get("message").and_then(|m| m.get("usage")) {
        return Some(parse_usage_object(usage));
    }
    // Gemini responses carry usageMetadata.
    if let Some(meta) = payload.get("usageMetadata") {
        return Some(Usage {
            input_tokens: get_i64(meta, "promptTokenCount"),
            output_tokens: get_i64(meta, "candidatesTokenCount"),
            cache_read_tokens: get_i64(meta, "cachedContentTokenCount"),
            ..Usage::default()
        });
    }
    // OpenAI Responses completion event.
    if let Some(usage) = payload.get("response").and_then(|r| r.get("usage")) {
        return Some(parse_usage_object(usage));
    }
    None
}
