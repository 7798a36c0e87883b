//! Unified error types
//!
//! One taxonomy for the whole core. Errors are classified once at the
//! forward boundary and carried as structured values; the retry controller
//! turns them into either another attempt or a single terminal response.
//! Client-visible rendering follows the wire shape of the requesting client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

/// Wire shape used when rendering an error back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFlavor {
    Anthropic,
    OpenAI,
    Google,
}

impl ClientFlavor {
    /// `{type:"error",error:{...}}` vs `{error:{...}}` vs Google's code/status.
    pub fn render(&self, status: u16, error_type: &str, message: &str) -> Value {
        match self {
            ClientFlavor::Anthropic => json!({
                "type": "error",
                "error": { "type": error_type, "message": message }
            }),
            ClientFlavor::OpenAI => json!({
                "error": { "type": error_type, "message": message }
            }),
            ClientFlavor::Google => json!({
                "error": {
                    "code": status,
                    "message": message,
                    "status": google_status_name(status),
                }
            }),
        }
    }
}

fn google_status_name(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ABORTED",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        500 => "INTERNAL",
        501 => "UNIMPLEMENTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// Signals the handler to re-enter the scheduler with a different account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailoverError {
    pub status: u16,
    /// Preserve cache accounting when a sticky session is re-homed.
    pub force_cache_billing: bool,
}

impl std::fmt::Display for UpstreamFailoverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream failover (status {})", self.status)
    }
}

/// Upstream rejected the prompt as too long; billing retries must be skipped.
#[derive(Debug, Clone)]
pub struct PromptTooLongError {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: Value,
}

impl std::fmt::Display for PromptTooLongError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "prompt is too long (status {})", self.status)
    }
}

/// Core error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Upstream request id, when the provider returned one.
        request_id: Option<String>,
    },

    #[error("{0}")]
    Failover(UpstreamFailoverError),

    #[error("{0}")]
    PromptTooLong(PromptTooLongError),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Authentication with upstream failed: {0}")]
    UpstreamAuth(String),

    #[error("No schedulable account in group {group_id}")]
    NoCandidate { group_id: u64 },

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Idempotency conflict; retry after {retry_after_secs}s")]
    IdempotencyConflict { retry_after_secs: u64 },

    #[error("Idempotency store unavailable: {0}")]
    IdempotencyUnavailable(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status presented to the client after local recovery is exhausted.
    pub fn client_status(&self) -> u16 {
        match self {
            GatewayError::Connection(_) => 502,
            GatewayError::Upstream { status, .. } => map_upstream_status(*status),
            GatewayError::Failover(f) => map_upstream_status(f.status),
            GatewayError::PromptTooLong(_) => 400,
            GatewayError::Timeout(_) => 504,
            GatewayError::Canceled => 499,
            GatewayError::UpstreamAuth(_) => 502,
            GatewayError::NoCandidate { .. } => 503,
            GatewayError::UnsupportedModel(_) => 400,
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::IdempotencyConflict { .. } => 409,
            GatewayError::IdempotencyUnavailable(_) => 503,
            GatewayError::Repository(_) => 500,
            GatewayError::Json(_) => 500,
            GatewayError::Http(_) => 502,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Connection(_) | GatewayError::Http(_) => "upstream_error",
            GatewayError::Upstream { status, .. } if *status == 429 => "rate_limit_error",
            GatewayError::Upstream { .. } | GatewayError::Failover(_) => "api_error",
            GatewayError::PromptTooLong(_) => "invalid_request_error",
            GatewayError::Timeout(_) => "timeout_error",
            GatewayError::Canceled => "request_canceled",
            GatewayError::UpstreamAuth(_) => "authentication_error",
            GatewayError::NoCandidate { .. } => "overloaded_error",
            GatewayError::UnsupportedModel(_) | GatewayError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            GatewayError::IdempotencyConflict { .. } => "conflict_error",
            GatewayError::IdempotencyUnavailable(_) => "overloaded_error",
            GatewayError::Repository(_) | GatewayError::Json(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Render with an explicit client flavor.
    pub fn into_response_for(self, flavor: ClientFlavor) -> Response {
        let status = self.client_status();
        let error_type = self.error_type();
        let message = self.to_string();

        crate::logger::error(
            "gateway",
            &format!(
                "Returning error response: status={}, type={}, message={}",
                status, error_type, message
            ),
        );

        let mut response = (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(flavor.render(status, error_type, &message)),
        )
            .into_response();

        if let GatewayError::IdempotencyConflict { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

fn map_upstream_status(status: u16) -> u16 {
    // Non-HTTP or pseudo statuses collapse to a gateway error.
    if (400..=599).contains(&status) {
        status
    } else {
        502
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for(ClientFlavor::Anthropic)
    }
}

/// Result type alias for core operations
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_shapes() {
        let a = ClientFlavor::Anthropic.render(429, "rate_limit_error", "slow down");
        assert_eq!(a["type"], "error");
        assert_eq!(a["error"]["type"], "rate_limit_error");

        let o = ClientFlavor::OpenAI.render(429, "rate_limit_error", "slow down");
        assert!(o.get("type").is_none());
        assert_eq!(o["error"]["message"], "slow down");

        let g = ClientFlavor::Google.render(429, "rate_limit_error", "slow down");
        assert_eq!(g["error"]["code"], 429);
        assert_eq!(g["error"]["status"], "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn test_client_status_mapping() {
        assert_eq!(
            GatewayError::Connection("refused".to_string()).client_status(),
            502
        );
        assert_eq!(
            GatewayError::Upstream {
                status: 429,
                message: "limited".to_string(),
                request_id: None
            }
            .client_status(),
            429
        );
        assert_eq!(
            GatewayError::PromptTooLong(PromptTooLongError {
                status: 400,
                request_id: None,
                body: serde_json::Value::Null
            })
            .client_status(),
            400
        );
    }
}
