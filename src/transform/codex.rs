//! Codex (OpenAI Responses) normalization
//!
//! The Responses endpoint only accepts streaming, stateless requests with
//! top-level tool definitions. Client bodies arrive in several dialects;
//! this module flattens them into the one shape the upstream takes.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::error::{GatewayError, GatewayResult};

use super::TransformedRequest;

/// Fixed alias table for model ids clients commonly send.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt5", "gpt-5"),
    ("gpt5-codex", "gpt-5-codex"),
    ("gpt-5-codex-latest", "gpt-5-codex"),
    ("codex", "gpt-5-codex"),
    ("codex-mini", "codex-mini-latest"),
];

/// Built-in instructions for requests from the Codex CLI.
const CODEX_CLI_INSTRUCTIONS: &str = "You are Codex, based on GPT-5. You are running as a coding agent in the Codex CLI on a user's computer.";

/// Instructions preferred for OpenCode-style clients.
const OPENCODE_INSTRUCTIONS: &str = "You are a coding agent running in OpenCode, a terminal-based agentic coding assistant. You are expected to be precise, safe, and helpful.";

fn is_codex_cli_user_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua.starts_with("codex") || ua.contains("codex_cli")
}

pub fn normalize_model(model: &str) -> String {
    for (alias, target) in MODEL_ALIASES {
        if model.eq_ignore_ascii_case(alias) {
            return target.to_string();
        }
    }
    model.to_string()
}

/// Lift `function.{name,description,parameters,strict}` to the top level;
/// tools without a usable name are dropped.
fn normalize_tools(tools: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let Some(obj) = tool.as_object() else {
            continue;
        };

        if let Some(function) = obj.get("function").and_then(|f| f.as_object()) {
            let Some(name) = function.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let mut lifted = serde_json::Map::new();
            lifted.insert("type".to_string(), json!("function"));
            lifted.insert("name".to_string(), json!(name));
            for key in ["description", "parameters", "strict"] {
                if let Some(value) = function.get(key) {
                    lifted.insert(key.to_string(), value.clone());
                }
            }
            out.push(Value::Object(lifted));
            continue;
        }

        // Already top-level: keep only function tools that carry a name,
        // pass non-function tools through untouched.
        let tool_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("function");
        if tool_type == "function" && obj.get("name").and_then(|n| n.as_str()).is_none() {
            continue;
        }
        out.push(tool.clone());
    }
    out
}

fn is_call_item(item_type: &str) -> bool {
    item_type.ends_with("_call") || item_type.ends_with("_call_output")
}

/// Drop `item_reference` entries and stored-state ids; call items keep their
/// linkage by lifting `id` into `call_id`.
fn filter_input(input: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(input.len());
    for item in input {
        let Some(obj) = item.as_object() else {
            out.push(item.clone());
            continue;
        };
        let item_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if item_type == "item_reference" {
            continue;
        }

        let mut cleaned = obj.clone();
        if is_call_item(item_type) {
            if !cleaned.contains_key("call_id") {
                if let Some(id) = cleaned.get("id").cloned() {
                    cleaned.insert("call_id".to_string(), id);
                }
            }
        }
        cleaned.remove("id");
        out.push(Value::Object(cleaned));
    }
    out
}

fn inject_instructions(body: &mut serde_json::Map<String, Value>, user_agent: &str) {
    let has_instructions = body
        .get("instructions")
        .and_then(|i| i.as_str())
        .map(|i| !i.is_empty())
        .unwrap_or(false);

    if is_codex_cli_user_agent(user_agent) {
        if !has_instructions {
            body.insert("instructions".to_string(), json!(CODEX_CLI_INSTRUCTIONS));
        }
        return;
    }

    // Non-CLI clients always get known-good instructions; OpenCode's are
    // preferred because they describe the tool loop the upstream expects.
    body.insert("instructions".to_string(), json!(OPENCODE_INSTRUCTIONS));
}

pub fn prepare(
    access_token: &str,
    payload: &Value,
    user_agent: &str,
) -> GatewayResult<TransformedRequest> {
    let mut body = payload
        .as_object()
        .cloned()
        .ok_or_else(|| GatewayError::InvalidRequest("request body must be an object".into()))?;

    body.insert("store".to_string(), json!(false));
    body.insert("stream".to_string(), json!(true));
    body.remove("max_output_tokens");
    body.remove("max_completion_tokens");

    if let Some(model) = body.get("model").and_then(|m| m.as_str()) {
        let normalized = normalize_model(model);
        body.insert("model".to_string(), json!(normalized));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()).cloned() {
        body.insert("tools".to_string(), Value::Array(normalize_tools(&tools)));
    }

    if let Some(input) = body.get("input").and_then(|i| i.as_array()).cloned() {
        body.insert("input".to_string(), Value::Array(filter_input(&input)));
    }

    inject_instructions(&mut body, user_agent);

    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", access_token))
            .map_err(|_| GatewayError::UpstreamAuth("access token is not header-safe".into()))?,
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    if let Ok(ua) = HeaderValue::from_str(user_agent) {
        headers.insert("user-agent", ua);
    }

    Ok(TransformedRequest {
        body: Value::Object(body),
        headers,
        path: "/responses".to_string(),
    })
}
