//! Claude Code client validation
//!
//! Some Anthropic OAuth accounts are only usable by the official CLI.
//! Requests claiming to be the CLI are checked on the user agent, the
//! canonical system prompt (Dice bigram similarity), and the CLI's header
//! and metadata fingerprints.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

/// Minimum Dice similarity against a canonical system prompt.
const SYSTEM_PROMPT_SIMILARITY_THRESHOLD: f64 = 0.5;

static USER_AGENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)claude-cli/\d+\.\d+\.\d+").expect("static regex"));

static METADATA_USER_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^user_[0-9a-f]{64}_account__session_[\w-]+$").expect("static regex")
});

/// Canonical Claude Code system prompt openings, one per CLI mode.
const CANONICAL_SYSTEM_PROMPTS: &[&str] = &[
    "You are Claude Code, Anthropic's official CLI for Claude.",
    "You are an interactive CLI tool that helps users with software engineering tasks. Use the instructions below and the tools available to you to assist the user.",
    "You are Claude Code, Anthropic's official CLI for Claude. You are an interactive CLI tool that helps users with software engineering tasks.",
    "You are an agent for Claude Code, Anthropic's official CLI for Claude. Given the user's message, you should use the tools available to complete the task.",
    "Analyze if this message indicates a new conversation topic. If it does, extract a 2-3 word title that captures the new topic.",
    "You are a command description generator for a CLI tool. Given a bash command, provide a brief description of what it does.",
];

/// Request fields the validator inspects; the handler extracts them from the
/// inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct ClientFingerprint {
    pub user_agent: String,
    pub x_app: String,
    pub anthropic_beta: String,
    pub anthropic_version: String,
    /// True for `/v1/messages`-shaped paths.
    pub is_messages_path: bool,
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Dice coefficient over character bigrams of the normalized inputs.
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let a = bigrams(&normalize(a));
    let b = bigrams(&normalize(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let overlap = a.intersection(&b).count();
    (2.0 * overlap as f64) / (a.len() + b.len()) as f64
}

fn system_prompt_text(body: &Value) -> String {
    match body.get("system") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn system_prompt_matches(body: &Value) -> bool {
    let system = system_prompt_text(body);
    if system.is_empty() {
        return false;
    }
    CANONICAL_SYSTEM_PROMPTS
        .iter()
        .any(|canonical| dice_similarity(&system, canonical) >= SYSTEM_PROMPT_SIMILARITY_THRESHOLD)
}

/// `max_tokens=1` Haiku probes are connectivity checks the CLI fires before
/// a session; they carry no real system prompt.
fn is_haiku_probe(body: &Value) -> bool {
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or("");
    let max_tokens = body.get("max_tokens").and_then(|m| m.as_i64());
    model.contains("haiku") && max_tokens == Some(1)
}

fn metadata_user_id_matches(body: &Value) -> bool {
    body.get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|u| u.as_str())
        .map(|u| METADATA_USER_ID_RE.is_match(u))
        .unwrap_or(false)
}

/// Full validation: the UA gate applies everywhere, the prompt/header/
/// metadata gates only on messages paths.
pub fn claude_code_validator_passes(fingerprint: &ClientFingerprint, body: &Value) -> bool {
    if !USER_AGENT_RE.is_match(&fingerprint.user_agent) {
        return false;
    }

    if !fingerprint.is_messages_path {
        return true;
    }

    if !is_haiku_probe(body) && !system_prompt_matches(body) {
        return false;
    }

    if fingerprint.x_app.is_empty()
        || fingerprint.anthropic_beta.is_empty()
        || fingerprint.anthropic_version.is_empty()
    {
        return false;
    }

    metadata_user_id_matches(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cli_fingerprint() -> ClientFingerprint {
        ClientFingerprint {
            user_agent: "claude-cli/1.0.83 (external, cli)".to_string(),
            x_app: "cli".to_string(),
            anthropic_beta: "claude-code-20250219".to_string(),
            anthropic_version: "2023-06-01".to_string(),
            is_messages_path: true,
        }
    }

    fn cli_body() -> Value {
        json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 8192,
            "system": "You are Claude Code, Anthropic's official CLI for Claude.",
            "metadata": {
                "user_id": format!("user_{}_account__session_abc-123", "a".repeat(64)),
            }
        })
    }

    #[test]
    fn test_dice_similarity_bounds() {
        assert_eq!(dice_similarity("hello world", "hello world"), 1.0);
        assert_eq!(dice_similarity("abc", "xyz"), 0.0);
        let partial = dice_similarity(
            "You are Claude Code, Anthropic's official CLI",
            "You are Claude Code, Anthropic's official CLI for Claude.",
        );
        assert!(partial > 0.5);
    }

    #[test]
    fn test_normalization_folds_whitespace_and_case() {
        assert_eq!(
            dice_similarity("You  Are\nCLAUDE code", "you are claude code"),
            1.0
        );
    }

    #[test]
    fn test_valid_cli_request_passes() {
        assert!(claude_code_validator_passes(&cli_fingerprint(), &cli_body()));
    }

    #[test]
    fn test_bad_user_agent_rejected() {
        let mut fp = cli_fingerprint();
        fp.user_agent = "python-requests/2.31".to_string();
        assert!(!claude_code_validator_passes(&fp, &cli_body()));

        fp.user_agent = "claude-cli/1.2".to_string();
        assert!(!claude_code_validator_passes(&fp, &cli_body()));
    }

    #[test]
    fn test_non_messages_path_only_needs_user_agent() {
        let mut fp = cli_fingerprint();
        fp.is_messages_path = false;
        fp.x_app = String::new();
        assert!(claude_code_validator_passes(&fp, &json!({})));
    }

    #[test]
    fn test_wrong_system_prompt_rejected() {
        let mut body = cli_body();
        body["system"] = json!("You are a helpful assistant.");
        assert!(!claude_code_validator_passes(&cli_fingerprint(), &body));
    }

    #[test]
    fn test_haiku_probe_bypasses_system_prompt() {
        let mut body = cli_body();
        body["model"] = json!("claude-haiku-4-5");
        body["max_tokens"] = json!(1);
        body["system"] = json!("quota probe");
        assert!(claude_code_validator_passes(&cli_fingerprint(), &body));

        // The probe still requires the CLI user agent.
        let mut fp = cli_fingerprint();
        fp.user_agent = "curl/8.0".to_string();
        assert!(!claude_code_validator_passes(&fp, &body));
    }

    #[test]
    fn test_missing_headers_rejected() {
        let mut fp = cli_fingerprint();
        fp.anthropic_beta = String::new();
        assert!(!claude_code_validator_passes(&fp, &cli_body()));
    }

    #[test]
    fn test_metadata_user_id_shape() {
        let mut body = cli_body();
        body["metadata"]["user_id"] = json!("user_123_account__session_x");
        assert!(!claude_code_validator_passes(&cli_fingerprint(), &body));

        body["metadata"] = json!({});
        assert!(!claude_code_validator_passes(&cli_fingerprint(), &body));
    }

    #[test]
    fn test_system_prompt_blocks_array() {
        let mut body = cli_body();
        body["system"] = json!([
            {"type": "text", "text": "You are Claude Code, Anthropic's official CLI for Claude."}
        ]);
        assert!(claude_code_validator_passes(&cli_fingerprint(), &body));
    }
}
