//! Antigravity transformation
//!
//! Wraps Claude or raw Gemini client requests into the provider's
//! `v1internal` envelope. The upstream refuses requests without an identity
//! system instruction, rejects cache_control anywhere, and 400s on thinking
//! blocks whose signatures it cannot verify; the sanitizers here deal with
//! all three. The reverse direction converts a collected Gemini response
//! back to Claude shape for Claude-flavored clients.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

use super::{is_thinking_enabled, strip_cache_control, DowngradeStage, TransformedRequest};

/// Identity system instruction required by the upstream; requests without it
/// are rejected with 429.
pub const IDENTITY_PATCH: &str = "You are Antigravity, an agentic coding assistant developed by Google, working with a user in an IDE.";

const IDENTITY_MARKER: &str = "You are Antigravity";

/// Thinking budget applied to claude thinking models when the client did not
/// set one.
const DEFAULT_THINKING_BUDGET: u32 = 8096;

/// Upstream action names; the streaming one is the provider's only real mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateContent,
    StreamGenerateContent,
}

impl Action {
    pub fn path(&self) -> &'static str {
        match self {
            Action::GenerateContent => "/v1internal:generateContent",
            Action::StreamGenerateContent => "/v1internal:streamGenerateContent?alt=sse",
        }
    }
}

/// `-thinking` suffix selects the thinking variant of claude models.
pub fn effective_model(mapped: &str, thinking: bool) -> String {
    if thinking && mapped.starts_with("claude-") && !mapped.ends_with("-thinking") {
        format!("{}-thinking", mapped)
    } else {
        mapped.to_string()
    }
}

fn headers(access_token: &str) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", access_token))
            .map_err(|_| GatewayError::UpstreamAuth("access token is not header-safe".into()))?,
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static("antigravity"));
    Ok(headers)
}

/// `{project, requestId, userAgent, requestType, model, request}`
fn envelope(project: &str, model: &str, request: Value) -> Value {
    json!({
        "project": project,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "userAgent": "antigravity",
        "requestType": "agent",
        "model": model,
        "request": request,
    })
}

fn system_instruction_has_identity(request: &Value) -> bool {
    request
        .get("systemInstruction")
        .and_then(|si| si.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts.iter().any(|part| {
                part.get("text")
                    .and_then(|t| t.as_str())
                    .map(|t| t.contains(IDENTITY_MARKER))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Prepend the identity patch. With `only_if_absent`, an existing identity
/// instruction is left alone.
pub fn inject_identity_patch(request: &mut Value, only_if_absent: bool) {
    if only_if_absent && system_instruction_has_identity(request) {
        return;
    }
    let Some(obj) = request.as_object_mut() else {
        return;
    };
    let patch = json!({"text": IDENTITY_PATCH});
    match obj.get_mut("systemInstruction") {
        Some(si) => {
            if let Some(parts) = si.get_mut("parts").and_then(|p| p.as_array_mut()) {
                parts.insert(0, patch);
            } else if let Some(si_obj) = si.as_object_mut() {
                si_obj.insert("parts".to_string(), json!([patch]));
            }
        }
        None => {
            obj.insert(
                "systemInstruction".to_string(),
                json!({"role": "user", "parts": [patch]}),
            );
        }
    }
}

fn text_part(text: &str) -> Value {
    json!({"text": text})
}

fn claude_block_to_part(
    block: &Value,
    is_last_message: bool,
    stage: DowngradeStage,
) -> Option<Value> {
    let block_type = block.get("type").and_then(|t| t.as_str())?;
    match block_type {
        "text" => block
            .get("text")
            .and_then(|t| t.as_str())
            .map(text_part),
        "thinking" => {
            let thinking = block.get("thinking").and_then(|t| t.as_str()).unwrap_or("");
            if thinking.is_empty() {
                return None;
            }
            // History thinking is flattened to text; only the live turn keeps
            // thought parts, and only while the stage allows them.
            if !is_last_message || stage != DowngradeStage::None {
                return Some(text_part(thinking));
            }
            let mut part = Map::new();
            part.insert("text".to_string(), json!(thinking));
            part.insert("thought".to_string(), json!(true));
            if let Some(signature) = block.get("signature").and_then(|s| s.as_str()) {
                part.insert("thoughtSignature".to_string(), json!(signature));
            }
            Some(Value::Object(part))
        }
        "redacted_thinking" => None,
        "tool_use" => {
            if stage == DowngradeStage::ToolsToText {
                let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                return Some(text_part(&format!("[tool call {}: {}]", name, input)));
            }
            Some(json!({
                "functionCall": {
                    "name": block.get("name").cloned().unwrap_or(json!("tool")),
                    "args": block.get("input").cloned().unwrap_or(json!({})),
                }
            }))
        }
        "tool_result" => {
            let content = tool_result_text(block);
            if stage == DowngradeStage::ToolsToText {
                return Some(text_part(&format!("[tool result: {}]", content)));
            }
            Some(json!({
                "functionResponse": {
                    "name": block.get("tool_use_id").cloned().unwrap_or(json!("tool")),
                    "response": {"result": content},
                }
            }))
        }
        "image" => Some(text_part("[image]")),
        _ => None,
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn claude_system_to_instruction(payload: &Value) -> Option<Value> {
    let parts: Vec<Value> = match payload.get("system") {
        Some(Value::String(s)) if !s.is_empty() => vec![text_part(s)],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(text_part))
            .collect(),
        _ => Vec::new(),
    };
    if parts.is_empty() {
        None
    } else {
        Some(json!({"role": "user", "parts": parts}))
    }
}

fn claude_tools_to_gemini(payload: &Value) -> Option<Value> {
    let tools = payload.get("tools")?.as_array()?;
    let declarations: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let mut decl = Map::new();
            decl.insert("name".to_string(), json!(name));
            if let Some(description) = tool.get("description") {
                decl.insert("description".to_string(), description.clone());
            }
            if let Some(schema) = tool.get("input_schema") {
                decl.insert("parameters".to_string(), schema.clone());
            }
            Some(Value::Object(decl))
        })
        .collect();
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{"functionDeclarations": declarations}]))
    }
}

fn generation_config(payload: &Value, thinking: bool, stage: DowngradeStage) -> Value {
    let mut config = Map::new();
    if let Some(max_tokens) = payload.get("max_tokens") {
        config.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if let Some(temperature) = payload.get("temperature") {
        config.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = payload.get("top_p") {
        config.insert("topP".to_string(), top_p.clone());
    }
    if let Some(top_k) = payload.get("top_k") {
        config.insert("topK".to_string(), top_k.clone());
    }
    if let Some(stops) = payload.get("stop_sequences") {
        config.insert("stopSequences".to_string(), stops.clone());
    }
    if thinking && stage == DowngradeStage::None {
        let budget = payload
            .get("thinking")
            .and_then(|t| t.get("budget_tokens"))
            .and_then(|b| b.as_u64())
            .unwrap_or(DEFAULT_THINKING_BUDGET as u64);
        config.insert(
            "thinkingConfig".to_string(),
            json!({"includeThoughts": true, "thinkingBudget": budget}),
        );
    }
    Value::Object(config)
}

/// Convert a Claude Messages body into a Gemini `generateContent` request.
pub fn claude_to_gemini_request(payload: &Value, stage: DowngradeStage) -> GatewayResult<Value> {
    let messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| GatewayError::InvalidRequest("messages array is required".into()))?;
    if messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".into()));
    }

    let thinking = is_thinking_enabled(payload);
    let last_index = messages.len() - 1;

    let mut contents = Vec::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        let role = match message.get("role").and_then(|r| r.as_str()) {
            Some("assistant") => "model",
            _ => "user",
        };
        let parts: Vec<Value> = match message.get("content") {
            Some(Value::String(s)) => vec![text_part(s)],
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| claude_block_to_part(b, index == last_index, stage))
                .collect(),
            _ => Vec::new(),
        };
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({"role": role, "parts": parts}));
    }

    let mut request = Map::new();
    request.insert("contents".to_string(), Value::Array(contents));
    if let Some(instruction) = claude_system_to_instruction(payload) {
        request.insert("systemInstruction".to_string(), instruction);
    }
    if stage != DowngradeStage::ToolsToText {
        if let Some(tools) = claude_tools_to_gemini(payload) {
            request.insert("tools".to_string(), tools);
        }
    }
    request.insert(
        "generationConfig".to_string(),
        generation_config(payload, thinking, stage),
    );

    let mut request = Value::Object(request);
    strip_cache_control(&mut request);
    Ok(request)
}

/// Claude client body -> enveloped v1internal request. The identity patch is
/// always injected.
pub fn prepare_claude(
    access_token: &str,
    project: &str,
    payload: &Value,
    model: &str,
    action: Action,
    stage: DowngradeStage,
) -> GatewayResult<TransformedRequest> {
    let mut request = claude_to_gemini_request(payload, stage)?;
    inject_identity_patch(&mut request, false);
    Ok(TransformedRequest {
        body: envelope(project, model, request),
        headers: headers(access_token)?,
        path: action.path().to_string(),
    })
}

/// Raw Gemini body -> enveloped v1internal request. The identity patch is
/// injected only when absent.
pub fn prepare_gemini(
    access_token: &str,
    project: &str,
    payload: &Value,
    model: &str,
    action: Action,
) -> GatewayResult<TransformedRequest> {
    let mut request = payload.clone();
    if request.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Err(GatewayError::InvalidRequest("empty request body".into()));
    }
    strip_cache_control(&mut request);
    inject_identity_patch(&mut request, true);
    Ok(TransformedRequest {
        body: envelope(project, model, request),
        headers: headers(access_token)?,
        path: action.path().to_string(),
    })
}

/// Unwrap the `{response: {...}}` envelope of v1internal SSE chunks; other
/// payloads pass through untouched.
pub fn unwrap_response_envelope(chunk: &Value) -> Value {
    chunk.get("response").cloned().unwrap_or_else(|| chunk.clone())
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "max_tokens",
        Some("STOP") | None => "end_turn",
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") => "refusal",
        Some(_) => "end_turn",
    }
}

/// Collected Gemini response -> Claude message for Claude-flavored clients.
pub fn gemini_response_to_claude(response: &Value, model: &str) -> Value {
    let mut content = Vec::new();
    let mut stop_reason = "end_turn";

    if let Some(candidate) = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        stop_reason = map_finish_reason(candidate.get("finishReason").and_then(|r| r.as_str()));
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(call) = part.get("functionCall") {
                    content.push(json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", Uuid::new_v4().simple()),
                        "name": call.get("name").cloned().unwrap_or(json!("tool")),
                        "input": call.get("args").cloned().unwrap_or(json!({})),
                    }));
                    stop_reason = "tool_use";
                } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                        content.push(json!({"type": "thinking", "thinking": text}));
                    } else {
                        content.push(json!({"type": "text", "text": text}));
                    }
                }
            }
        }
    }

    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let usage = response.get("usageMetadata");
    let input_tokens = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let cache_read = usage
        .and_then(|u| u.get("cachedContentTokenCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "cache_read_input_tokens": cache_read,
        }
    })
}
