//! Error classification & policy
//!
//! One pure function turns `(status, headers, body, account, context)` into
//! a directive for the retry controller plus the health mark to install.
//! Every provider-specific rule lives here so the controller stays a plain
//! state machine.

use std::time::Duration;

use serde_json::Value;

use crate::account::{Account, Platform, QuotaScope};
use crate::config::{PassThroughRule, TempUnschedulableRule};

/// Statuses worth a backoff-and-retry on the same account.
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504, 529];

/// Statuses that justify switching accounts once retries are exhausted.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || (500..=599).contains(&status)
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// What the controller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Forward the response to the client as-is.
    Deliver,
    /// Sleep the backoff and retry the same account and URL.
    RetrySameUrl,
    /// Try the next base URL.
    UrlFallback,
    /// Short provider hint: wait in place, then retry.
    SmartRetry { wait: Duration },
    /// Re-enter the scheduler on a different account.
    SwitchAccount { force_cache_billing: bool },
    /// Retry once at the next transformer downgrade stage.
    DowngradeRetry,
    /// Retry once with the configured fallback model.
    ModelFallback { model: String },
    /// Respond with a remapped error; no failover.
    PassThrough {
        status: u16,
        error_type: Option<String>,
        message: String,
    },
    /// Typed prompt-too-long error; billing retries are skipped.
    PromptTooLong,
    /// Unrecoverable; surface the mapped error.
    Fatal,
}

/// Health-state change the controller applies through the store.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthMark {
    RateLimited { reset_in: Duration },
    ModelRateLimit { model: String, reset_in: Duration },
    QuotaScopeLimit { scope: QuotaScope, reset_in: Duration },
    TempUnschedulable { until_minutes: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub directive: Directive,
    pub mark: Option<HealthMark>,
}

impl Classification {
    fn plain(directive: Directive) -> Self {
        Self {
            directive,
            mark: None,
        }
    }
}

/// Attempt-local state the classifier needs to pick a directive.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub attempts_remaining: bool,
    pub has_more_urls: bool,
    pub downgrade_available: bool,
    pub smart_retries_remaining: bool,
    pub is_sticky: bool,
    pub temp_rules: Vec<TempUnschedulableRule>,
    pub pass_through_rules: Vec<PassThroughRule>,
    /// Seconds; provider hints below this are waited out in place.
    pub smart_retry_threshold_secs: u64,
    pub fallback_model: Option<String>,
    pub model_fallback_tried: bool,
    /// Quota scope of the effective model (Antigravity only).
    pub model_scope: Option<QuotaScope>,
}

// ============================================================================
// Go-style duration parsing
// ============================================================================

/// Parse a Go-style duration (`15s`, `0.5s`, `100ms`, `1m30s`, composites).
/// Units: `ms`, `s`, `m`.
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total = Duration::ZERO;

    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == start {
            return None;
        }
        let number: f64 = s[start..i].parse().ok()?;

        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let nanos = match &s[unit_start..i] {
            "ms" => number * 1e6,
            "s" => number * 1e9,
            "m" => number * 60.0 * 1e9,
            _ => return None,
        };
        total += Duration::from_nanos(nanos.round() as u64);
    }

    Some(total)
}

// ============================================================================
// Google error details
// ============================================================================

/// Structured fields pulled from `error.details` of a Google-style error
/// body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoogleErrorDetails {
    pub reason: Option<String>,
    pub model: Option<String>,
    pub quota_reset_delay: Option<Duration>,
    pub retry_delay: Option<Duration>,
    pub message: Option<String>,
}

pub fn parse_google_error(body: &Value) -> GoogleErrorDetails {
    let mut out = GoogleErrorDetails::default();
    let Some(error) = body.get("error") else {
        return out;
    };
    out.message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());

    let Some(details) = error.get("details").and_then(|d| d.as_array()) else {
        return out;
    };
    for detail in details {
        let type_url = detail.get("@type").and_then(|t| t.as_str()).unwrap_or("");
        if type_url.ends_with("google.rpc.ErrorInfo") {
            out.reason = detail
                .get("reason")
                .and_then(|r| r.as_str())
                .map(|r| r.to_string());
            if let Some(metadata) = detail.get("metadata") {
                out.model = metadata
                    .get("model")
                    .and_then(|m| m.as_str())
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_string());
                out.quota_reset_delay = metadata
                    .get("quotaResetDelay")
                    .and_then(|d| d.as_str())
                    .and_then(parse_go_duration);
            }
        } else if type_url.ends_with("google.rpc.RetryInfo") {
            out.retry_delay = detail
                .get("retryDelay")
                .and_then(|d| d.as_str())
                .and_then(parse_go_duration);
        }
    }
    out
}

/// Reset window for a generic Gemini-family 429: the quota reset delay
/// (ceiled to a whole second) when the provider names one, otherwise five
/// minutes when it at least hints a retry delay, otherwise one minute.
pub fn gemini_rate_limit_reset(details: &GoogleErrorDetails) -> Duration {
    if let Some(delay) = details.quota_reset_delay {
        let secs = delay.as_secs_f64().ceil() as u64;
        return Duration::from_secs(secs.max(1));
    }
    if details.retry_delay.is_some() {
        return Duration::from_secs(300);
    }
    Duration::from_secs(60)
}

// ============================================================================
// Body heuristics
// ============================================================================

/// Antigravity rejects thinking blocks with signatures it cannot verify.
pub fn is_signature_error(status: u16, body: &str) -> bool {
    if status != 400 {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("signature")
        || lower.contains("expected thinking")
        || lower.contains("redacted_thinking")
}

pub fn is_prompt_too_long(body: &Value) -> bool {
    let message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("");
    message.trim().eq_ignore_ascii_case("prompt is too long")
}

fn is_model_not_found(status: u16, body: &str) -> bool {
    status == 404 && body.to_lowercase().contains("model") && body.to_lowercase().contains("not found")
}

fn first_matching_temp_rule<'a>(
    rules: &'a [TempUnschedulableRule],
    status: u16,
    body: &str,
) -> Option<(&'a TempUnschedulableRule, String)> {
    let lower = body.to_lowercase();
    for rule in rules {
        if rule.error_code != status || rule.duration_minutes == 0 {
            continue;
        }
        if let Some(keyword) = rule
            .keywords
            .iter()
            .find(|k| lower.contains(&k.to_lowercase()))
        {
            return Some((rule, keyword.clone()));
        }
    }
    None
}

// ============================================================================
// Classification
// ============================================================================

/// Antigravity structured rate-limit hint: 429 RATE_LIMIT_EXCEEDED or 503
/// MODEL_CAPACITY_EXHAUSTED naming a model.
fn antigravity_smart_limit(status: u16, details: &GoogleErrorDetails) -> Option<String> {
    let reason = details.reason.as_deref()?;
    let triggered = (status == 429 && reason == "RATE_LIMIT_EXCEEDED")
        || (status == 503 && reason == "MODEL_CAPACITY_EXHAUSTED");
    if triggered {
        details.model.clone()
    } else {
        None
    }
}

/// Classify one upstream response. Pure; the caller applies the returned
/// mark and acts on the directive.
pub fn classify(
    status: u16,
    body_text: &str,
    account: &Account,
    ctx: &ClassifyContext,
) -> Classification {
    if (200..300).contains(&status) {
        return Classification::plain(Directive::Deliver);
    }

    let body: Value = serde_json::from_str(body_text).unwrap_or(Value::Null);

    // Keyword rules first: they exist to pull a sick account out of rotation
    // before any retry budget is spent.
    if let Some((rule, keyword)) = first_matching_temp_rule(&ctx.temp_rules, status, body_text) {
        return Classification {
            directive: Directive::SwitchAccount {
                force_cache_billing: ctx.is_sticky,
            },
            mark: Some(HealthMark::TempUnschedulable {
                until_minutes: rule.duration_minutes,
                reason: keyword,
            }),
        };
    }

    if let Some(rule) = ctx
        .pass_through_rules
        .iter()
        .find(|r| r.matches(status, body_text))
    {
        return Classification::plain(Directive::PassThrough {
            status: rule.response_code,
            error_type: rule.response_type.clone(),
            message: rule.message.clone(),
        });
    }

    // Custom error-code policy: statuses the operator did not list are
    // masked to a generic 500 and never marked. An empty list masks
    // everything.
    if account.custom_error_codes_enabled() {
        let listed = account.custom_error_codes();
        if !listed.contains(&status) {
            return Classification::plain(Directive::PassThrough {
                status: 500,
                error_type: Some("api_error".to_string()),
                message: "upstream error".to_string(),
            });
        }
    }

    if account.platform == Platform::Antigravity
        && is_signature_error(status, body_text)
        && ctx.downgrade_available
    {
        return Classification::plain(Directive::DowngradeRetry);
    }

    if status == 400 && is_prompt_too_long(&body) {
        return Classification::plain(Directive::PromptTooLong);
    }

    if is_model_not_found(status, body_text) {
        if let Some(fallback) = ctx.fallback_model.clone() {
            if !ctx.model_fallback_tried {
                return Classification::plain(Directive::ModelFallback { model: fallback });
            }
        }
        return Classification::plain(Directive::Deliver);
    }

    let google = parse_google_error(&body);

    // A quota exhaustion without a model name empties the whole scope the
    // request was headed for.
    if account.platform == Platform::Antigravity
        && status == 429
        && google.model.is_none()
        && matches!(
            google.reason.as_deref(),
            Some("QUOTA_EXHAUSTED") | Some("RESOURCE_EXHAUSTED")
        )
    {
        if let Some(scope) = ctx.model_scope {
            return Classification {
                directive: Directive::SwitchAccount {
                    force_cache_billing: ctx.is_sticky,
                },
                mark: Some(HealthMark::QuotaScopeLimit {
                    scope,
                    reset_in: gemini_rate_limit_reset(&google),
                }),
            };
        }
    }

    // Antigravity's structured hint names the exhausted model: short delays
    // are retried in place, anything else marks that model and switches.
    if account.platform == Platform::Antigravity {
        if let Some(model) = antigravity_smart_limit(status, &google) {
            let threshold = Duration::from_secs(ctx.smart_retry_threshold_secs);
            match google.retry_delay {
                Some(delay) if delay < threshold && ctx.smart_retries_remaining => {
                    return Classification::plain(Directive::SmartRetry {
                        wait: delay.max(Duration::from_secs(1)),
                    });
                }
                _ => {
                    return Classification {
                        directive: Directive::SwitchAccount {
                            force_cache_billing: ctx.is_sticky,
                        },
                        mark: Some(HealthMark::ModelRateLimit {
                            model,
                            reset_in: google.retry_delay.unwrap_or(threshold),
                        }),
                    };
                }
            }
        }
    }

    if status == 429 {
        // With another base URL left, the 429 is blamed on the URL, not the
        // account.
        if ctx.has_more_urls {
            return Classification::plain(Directive::UrlFallback);
        }
        let mark = Some(HealthMark::RateLimited {
            reset_in: gemini_rate_limit_reset(&google),
        });
        let directive = if ctx.attempts_remaining {
            Directive::RetrySameUrl
        } else {
            Directive::SwitchAccount {
                force_cache_billing: ctx.is_sticky,
            }
        };
        return Classification { directive, mark };
    }

    if is_retryable_status(status) {
        if ctx.attempts_remaining {
            return Classification::plain(Directive::RetrySameUrl);
        }
        return Classification {
            directive: Directive::SwitchAccount {
                force_cache_billing: ctx.is_sticky,
            },
            // Retries exhausted on a 5xx: give the account a short breather.
            mark: Some(HealthMark::RateLimited {
                reset_in: Duration::from_secs(60),
            }),
        };
    }

    if is_failover_status(status) {
        return Classification::plain(Directive::SwitchAccount {
            force_cache_billing: ctx.is_sticky,
        });
    }

    Classification::plain(Directive::Deliver)
}
