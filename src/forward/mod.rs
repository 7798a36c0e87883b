//! Forwarding core
//!
//! Drives one client request through one or more upstream attempts. The
//! retry controller is an explicit state machine: token, pre-check, issue,
//! classify, then act on the directive (retry in place, fall back to the
//! next URL, downgrade the transform, switch accounts, or deliver). The
//! [`Gateway`] wrapper adds the outer loop that re-enters the scheduler on a
//! switch-account signal.

pub mod classify;
pub mod stream;
pub mod usage;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use reqwest::header::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::account::{Account, AccountType, Platform};
use crate::config;
use crate::error::{
    ClientFlavor, GatewayError, GatewayResult, PromptTooLongError, UpstreamFailoverError,
};
use crate::health::HealthStore;
use crate::repo::{OpsRepository, UsageRecord};
use crate::scheduler::{Scheduler, StickyHint};
use crate::token::TokenProvider;
use crate::transform::{self, antigravity, DowngradeStage, TransformedRequest};
use crate::upstream::{urls::UrlAvailability, AttemptResponse, HttpUpstream, UpstreamRequest};

use classify::{classify, ClassifyContext, Directive, HealthMark};
use stream::{collect_stream, sse_passthrough, StreamOptions, StreamOutcome};
use usage::Usage;

/// Backoff ceiling per attempt.
const BACKOFF_CAP: Duration = Duration::from_secs(16);

// ============================================================================
// Request context
// ============================================================================

/// Cancels the paired [`RequestContext`].
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation and deadline view of one client request. Every suspension
/// point in the controller goes through [`sleep`](Self::sleep) or checks
/// [`is_cancelled`](Self::is_cancelled).
#[derive(Clone)]
pub struct RequestContext {
    deadline: Option<tokio::time::Instant>,
    cancel_rx: watch::Receiver<bool>,
}

impl RequestContext {
    pub fn new() -> (Self, CancelHandle) {
        let (tx, cancel_rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel_rx,
            },
            CancelHandle { tx },
        )
    }

    pub fn with_deadline(timeout: Duration) -> (Self, CancelHandle) {
        let (mut ctx, handle) = Self::new();
        ctx.deadline = Some(tokio::time::Instant::now() + timeout);
        (ctx, handle)
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.cancel_rx.borrow() {
            return true;
        }
        self.deadline
            .map(|d| tokio::time::Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Remaining time until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
    }

    /// Context-aware sleep: returns `Canceled` as soon as the request is
    /// canceled or its deadline fires, never later than `duration`.
    pub async fn sleep(&self, duration: Duration) -> GatewayResult<()> {
        if self.is_cancelled() {
            return Err(GatewayError::Canceled);
        }
        let wake = tokio::time::Instant::now() + duration;
        let (wake, truncated) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {
                if truncated {
                    Err(GatewayError::Canceled)
                } else {
                    Ok(())
                }
            }
            _ = cancel_rx.wait_for(|c| *c) => Err(GatewayError::Canceled),
        }
    }
}

// ============================================================================
// Handler contract
// ============================================================================

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub request_id: String,
    pub group_id: u64,
    /// Client-requested model id, before account mapping.
    pub model: String,
    pub body: Value,
    pub stream: bool,
    pub client_flavor: ClientFlavor,
    pub client_headers: HeaderMap,
    pub sticky: Option<StickyHint>,
}

impl ForwardRequest {
    pub fn new(group_id: u64, model: &str, body: Value) -> Self {
        Self {
            request_id: format!("req_{}", Uuid::new_v4().simple()),
            group_id,
            model: model.to_string(),
            body,
            stream: false,
            client_flavor: ClientFlavor::Anthropic,
            client_headers: HeaderMap::new(),
            sticky: None,
        }
    }
}

/// Delivered payload: either a live SSE response or a collected JSON body.
#[derive(Debug)]
pub enum Delivery {
    Stream {
        response: axum::response::Response,
        /// Resolves with final usage once the stream closes.
        outcome: oneshot::Receiver<StreamOutcome>,
    },
    Json {
        status: u16,
        body: Value,
    },
}

#[derive(Debug)]
pub struct ForwardResult {
    pub request_id: String,
    pub account_id: u64,
    pub model: String,
    pub stream: bool,
    pub usage: Usage,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    /// Set after a sticky failover so billing keeps the original cache
    /// accounting semantics.
    pub force_cache_billing: bool,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub image_count: Option<u32>,
    pub image_size: Option<String>,
    pub delivery: Delivery,
}

// ============================================================================
// Controller
// ============================================================================

pub struct ForwardController {
    store: Arc<HealthStore>,
    tokens: Arc<dyn TokenProvider>,
    upstream: Arc<dyn HttpUpstream>,
    ops: Arc<dyn OpsRepository>,
}

/// Explicit state of the attempt loop.
struct AttemptState {
    urls: Vec<String>,
    url_index: usize,
    attempts_on_url: u32,
    smart_retries: u32,
    downgrade: DowngradeStage,
    model_fallback_tried: bool,
    model: String,
}

impl AttemptState {
    fn current_url(&self) -> &str {
        &self.urls[self.url_index]
    }

    fn has_more_urls(&self) -> bool {
        self.url_index + 1 < self.urls.len()
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let cfg = config::load().retry;
    let base = Duration::from_millis(cfg.base_delay_ms);
    let exp = base
        .checked_mul(1u32 << attempt.saturating_sub(1).min(10))
        .unwrap_or(BACKOFF_CAP);
    let capped = exp
        .min(BACKOFF_CAP)
        .min(Duration::from_millis(cfg.max_delay_ms));
    // +-20% jitter.
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

fn default_base_urls(platform: Platform) -> Vec<String> {
    let urls: &[&str] = match platform {
        Platform::Anthropic => &["https://api.anthropic.com"],
        Platform::OpenAI => &["https://chatgpt.com/backend-api/codex"],
        Platform::Gemini => &["https://generativelanguage.googleapis.com"],
        Platform::Antigravity => &[
            "https://cloudcode-pa.googleapis.com",
            "https://daily-cloudcode-pa.googleapis.com",
        ],
        Platform::Sora => &["https://sora.chatgpt.com/backend"],
    };
    urls.iter().map(|s| s.to_string()).collect()
}

/// Base URLs for an account: the credential override, else platform
/// defaults.
pub fn base_urls(account: &Account) -> Vec<String> {
    match account.credentials.get_str("base_url") {
        Some(url) => vec![url.trim_end_matches('/').to_string()],
        None => default_base_urls(account.platform),
    }
}

fn truncate_for_log(body: &str) -> String {
    let cfg = config::load().gateway;
    if !cfg.log_upstream_error_body {
        return String::new();
    }
    let max = cfg.log_upstream_error_body_max_bytes;
    if body.len() > max {
        let mut end = max;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

impl ForwardController {
    pub fn new(
        store: Arc<HealthStore>,
        tokens: Arc<dyn TokenProvider>,
        upstream: Arc<dyn HttpUpstream>,
        ops: Arc<dyn OpsRepository>,
    ) -> Self {
        Self {
            store,
            tokens,
            upstream,
            ops,
        }
    }

    /// Pre-check: an Antigravity account whose target model is inside a
    /// short rate-limit window is waited out in place; a longer window
    /// returns the switch signal without consuming an attempt.
    async fn pre_check(
        &self,
        ctx: &RequestContext,
        account: &Account,
        model: &str,
        sticky_reused: bool,
    ) -> GatewayResult<()> {
        if account.platform != Platform::Antigravity
            || account.account_type != AccountType::OAuth
        {
            return Ok(());
        }
        let Some(limit) = account.health.model_rate_limits.get(model) else {
            return Ok(());
        };
        let now = Utc::now();
        if limit.reset_at <= now {
            return Ok(());
        }
        let remaining = (limit.reset_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        let threshold =
            Duration::from_secs(config::load().retry.smart_retry_threshold_seconds);

        if remaining < threshold {
            crate::logger::debug(
                "forward",
                &format!(
                    "Waiting out model limit in place: account={}, model={}, remaining={:?}",
                    account.id, model, remaining
                ),
            );
            ctx.sleep(remaining).await?;
            return Ok(());
        }

        Err(GatewayError::Failover(UpstreamFailoverError {
            status: 429,
            force_cache_billing: sticky_reused,
        }))
    }

    fn transform_for(
        &self,
        account: &Account,
        token: &str,
        request: &ForwardRequest,
        state: &AttemptState,
    ) -> GatewayResult<TransformedRequest> {
        match account.platform {
            Platform::Anthropic => {
                transform::anthropic::prepare(token, &request.body, &request.client_headers)
            }
            Platform::OpenAI => {
                let user_agent = request
                    .client_headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                transform::codex::prepare(token, &request.body, user_agent)
            }
            Platform::Antigravity => {
                let project = account
                    .credentials
                    .get_str("project_id")
                    .unwrap_or_default();
                // Streaming is the provider's only real mode; non-stream
                // client requests are collected from the stream afterwards.
                let action = antigravity::Action::StreamGenerateContent;
                match request.client_flavor {
                    ClientFlavor::Google => antigravity::prepare_gemini(
                        token,
                        &project,
                        &request.body,
                        &state.model,
                        action,
                    ),
                    _ => antigravity::prepare_claude(
                        token,
                        &project,
                        &request.body,
                        &state.model,
                        action,
                        state.downgrade,
                    ),
                }
            }
            Platform::Gemini => transform::gemini_native(
                token,
                account.account_type == AccountType::ApiKey,
                &request.body,
                &state.model,
                request.stream,
            ),
            Platform::Sora => transform::sora(token, &request.body),
        }
    }

    async fn apply_mark(&self, account: &Account, mark: HealthMark) {
        let now = Utc::now();
        let result = match mark {
            HealthMark::RateLimited { reset_in } => {
                self.store
                    .set_rate_limited(account.id, now + chrono::Duration::from_std(reset_in).unwrap_or_default())
                    .await
            }
            HealthMark::ModelRateLimit { model, reset_in } => {
                self.store
                    .set_model_rate_limit(
                        account.id,
                        &model,
                        now + chrono::Duration::from_std(reset_in).unwrap_or_default(),
                    )
                    .await
            }
            HealthMark::QuotaScopeLimit { scope, reset_in } => {
                self.store
                    .set_quota_scope_limit(
                        account.id,
                        scope,
                        now + chrono::Duration::from_std(reset_in).unwrap_or_default(),
                    )
                    .await
            }
            HealthMark::TempUnschedulable {
                until_minutes,
                reason,
            } => {
                self.store
                    .set_temp_unschedulable(
                        account.id,
                        now + chrono::Duration::minutes(until_minutes as i64),
                        &reason,
                    )
                    .await
            }
        };
        if let Err(e) = result {
            crate::logger::error(
                "forward",
                &format!("Failed to record health mark for account {}: {}", account.id, e),
            );
        }
    }

    fn classify_context(
        &self,
        request: &ForwardRequest,
        account: &Account,
        state: &AttemptState,
        sticky_reused: bool,
    ) -> ClassifyContext {
        let cfg = config::load();
        ClassifyContext {
            attempts_remaining: state.attempts_on_url + 1 < cfg.retry.max_attempts,
            has_more_urls: state.has_more_urls(),
            downgrade_available: account.platform == Platform::Antigravity
                && state.downgrade.next().is_some()
                && request.client_flavor != ClientFlavor::Google,
            smart_retries_remaining: state.smart_retries < cfg.retry.smart_retry_max,
            is_sticky: sticky_reused || request.sticky.is_some(),
            temp_rules: cfg.temp_unschedulable_rules.clone(),
            pass_through_rules: cfg.pass_through_rules.clone(),
            smart_retry_threshold_secs: cfg.retry.smart_retry_threshold_seconds,
            fallback_model: account.extra.get_str("fallback_model"),
            model_fallback_tried: state.model_fallback_tried,
            model_scope: (account.platform == Platform::Antigravity)
                .then(|| crate::account::QuotaScope::for_model(&state.model))
                .flatten(),
        }
    }

    /// Drive one request on one account. A `Failover` error tells the caller
    /// to re-enter the scheduler.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        account: Arc<Account>,
        urls: &UrlAvailability,
        request: &ForwardRequest,
        sticky_reused: bool,
    ) -> GatewayResult<ForwardResult> {
        let started = Instant::now();

        let mapped = account.get_mapped_model(&request.model);
        let effective = if account.platform == Platform::Antigravity {
            antigravity::effective_model(&mapped, transform::is_thinking_enabled(&request.body))
        } else {
            mapped
        };

        self.pre_check(ctx, &account, &effective, sticky_reused).await?;

        let ordered = urls.ordered();
        if ordered.is_empty() {
            return Err(GatewayError::Internal("no base URLs configured".into()));
        }

        let mut state = AttemptState {
            urls: ordered,
            url_index: 0,
            attempts_on_url: 0,
            smart_retries: 0,
            downgrade: DowngradeStage::None,
            model_fallback_tried: false,
            model: effective,
        };

        loop {
            if ctx.is_cancelled() {
                return Err(GatewayError::Canceled);
            }

            let token = self.tokens.get_access_token(&account).await?;
            // Each attempt builds a fresh request so retries are idempotent.
            let transformed = self.transform_for(&account, &token, request, &state)?;
            let url = format!("{}{}", state.current_url().trim_end_matches('/'), transformed.path);

            let mut upstream_request =
                UpstreamRequest::post(&url, transformed.headers.clone(), transformed.body.clone());
            upstream_request.account_id = account.id;
            upstream_request.account_concurrency = account.concurrency;
            upstream_request.proxy_url = account.proxy_url.clone();
            upstream_request.tls_fingerprint = account.tls_fingerprint_enabled();
            if account.platform == Platform::Sora {
                let cfg = config::load().gateway;
                let secs = if request.stream {
                    cfg.sora_stream_timeout_seconds
                } else {
                    cfg.sora_request_timeout_seconds
                };
                upstream_request.timeout = Duration::from_secs(secs.max(1));
            }
            if let Some(remaining) = ctx.remaining() {
                upstream_request.timeout = upstream_request.timeout.min(remaining.max(Duration::from_millis(1)));
            }

            let response = match self.upstream.issue(upstream_request).await {
                Ok(response) => response,
                Err(GatewayError::Connection(message)) | Err(GatewayError::Timeout(message)) => {
                    crate::logger::warn(
                        "forward",
                        &format!("Attempt failed on {}: {}", state.current_url(), message),
                    );
                    if ctx.is_cancelled() {
                        return Err(GatewayError::Canceled);
                    }
                    urls.mark_unavailable(state.current_url());
                    if state.has_more_urls() {
                        state.url_index += 1;
                        state.attempts_on_url = 0;
                        continue;
                    }
                    state.attempts_on_url += 1;
                    if state.attempts_on_url >= config::load().retry.max_attempts {
                        return Err(GatewayError::Connection(message));
                    }
                    ctx.sleep(jittered_backoff(state.attempts_on_url)).await?;
                    continue;
                }
                Err(other) => return Err(other),
            };

            if response.is_success() {
                urls.mark_success(state.current_url());
                let _ = self.store.touch_last_used(account.id).await;
                return self
                    .deliver(ctx, &account, request, &state, response, started)
                    .await;
            }

            let (status, _headers, body_text) = response.collect_text().await?;
            let logged = truncate_for_log(&body_text);
            if !logged.is_empty() {
                crate::logger::warn(
                    "forward",
                    &format!("Upstream {} from {}: {}", status, state.current_url(), logged),
                );
            }

            let classify_ctx = self.classify_context(request, &account, &state, sticky_reused);
            let classify::Classification { directive, mark } =
                classify(status, &body_text, &account, &classify_ctx);

            if let Some(mark) = mark {
                self.apply_mark(&account, mark).await;
            }

            match directive {
                Directive::Deliver => {
                    let body: Value = serde_json::from_str(&body_text)
                        .unwrap_or_else(|_| Value::String(body_text.clone()));
                    return Ok(self.error_result(account.id, request, &state, status, body, started));
                }
                Directive::RetrySameUrl => {
                    state.attempts_on_url += 1;
                    ctx.sleep(jittered_backoff(state.attempts_on_url)).await?;
                }
                Directive::UrlFallback => {
                    urls.mark_unavailable(state.current_url());
                    state.url_index += 1;
                    state.attempts_on_url = 0;
                }
                Directive::SmartRetry { wait } => {
                    state.smart_retries += 1;
                    crate::logger::info(
                        "forward",
                        &format!(
                            "Smart retry {} for account {} in {:?}",
                            state.smart_retries, account.id, wait
                        ),
                    );
                    ctx.sleep(wait).await?;
                }
                Directive::SwitchAccount {
                    force_cache_billing,
                } => {
                    return Err(GatewayError::Failover(UpstreamFailoverError {
                        status,
                        force_cache_billing,
                    }));
                }
                Directive::DowngradeRetry => {
                    if let Some(next) = state.downgrade.next() {
                        crate::logger::warn(
                            "forward",
                            &format!(
                                "Signature rejection; retrying at downgrade stage {:?}",
                                next
                            ),
                        );
                        state.downgrade = next;
                    }
                }
                Directive::ModelFallback { model } => {
                    crate::logger::warn(
                        "forward",
                        &format!("Model not found; retrying with fallback {}", model),
                    );
                    state.model = model;
                    state.model_fallback_tried = true;
                }
                Directive::PassThrough {
                    status,
                    error_type,
                    message,
                } => {
                    let flavor_status = status;
                    let body = request.client_flavor.render(
                        flavor_status,
                        error_type.as_deref().unwrap_or("api_error"),
                        &message,
                    );
                    return Ok(self.error_result(
                        account.id,
                        request,
                        &state,
                        flavor_status,
                        body,
                        started,
                    ));
                }
                Directive::PromptTooLong => {
                    let body: Value =
                        serde_json::from_str(&body_text).unwrap_or(Value::Null);
                    return Err(GatewayError::PromptTooLong(PromptTooLongError {
                        status,
                        request_id: Some(request.request_id.clone()),
                        body,
                    }));
                }
                Directive::Fatal => {
                    return Err(GatewayError::Upstream {
                        status,
                        message: body_text,
                        request_id: None,
                    });
                }
            }
        }
    }

    fn error_result(
        &self,
        account_id: u64,
        request: &ForwardRequest,
        state: &AttemptState,
        status: u16,
        body: Value,
        started: Instant,
    ) -> ForwardResult {
        ForwardResult {
            request_id: request.request_id.clone(),
            account_id,
            model: state.model.clone(),
            stream: false,
            usage: Usage::default(),
            duration_ms: started.elapsed().as_millis() as u64,
            first_token_ms: None,
            force_cache_billing: false,
            media_type: None,
            media_url: None,
            image_count: None,
            image_size: None,
            delivery: Delivery::Json { status, body },
        }
    }

    async fn deliver(
        &self,
        _ctx: &RequestContext,
        account: &Account,
        request: &ForwardRequest,
        state: &AttemptState,
        response: AttemptResponse,
        started: Instant,
    ) -> GatewayResult<ForwardResult> {
        let mut options = StreamOptions::default();
        options.unwrap_envelope = account.platform == Platform::Antigravity;

        let is_sse = account.platform == Platform::Antigravity
            || account.platform == Platform::OpenAI
            || (request.stream && account.platform != Platform::Sora);

        if request.stream && is_sse {
            let (client_response, outcome_rx) = sse_passthrough(response, options, started);
            let outcome_rx = self.spawn_usage_reporter(account.id, request, state, started, outcome_rx);
            return Ok(ForwardResult {
                request_id: request.request_id.clone(),
                account_id: account.id,
                model: state.model.clone(),
                stream: true,
                usage: Usage::default(),
                duration_ms: started.elapsed().as_millis() as u64,
                first_token_ms: None,
                force_cache_billing: false,
                media_type: None,
                media_url: None,
                image_count: None,
                image_size: None,
                delivery: Delivery::Stream {
                    response: client_response,
                    outcome: outcome_rx,
                },
            });
        }

        if !request.stream && is_sse {
            // Stream-only providers: collect, then answer in the client's
            // shape.
            let collected = collect_stream(response, options, started).await?;
            let body = if account.platform == Platform::Antigravity
                && request.client_flavor == ClientFlavor::Anthropic
            {
                antigravity::gemini_response_to_claude(&collected.final_chunk, &state.model)
            } else {
                collected.final_chunk
            };
            let result = ForwardResult {
                request_id: request.request_id.clone(),
                account_id: account.id,
                model: state.model.clone(),
                stream: false,
                usage: collected.usage,
                duration_ms: started.elapsed().as_millis() as u64,
                first_token_ms: collected.first_token_ms,
                force_cache_billing: false,
                media_type: None,
                media_url: None,
                image_count: None,
                image_size: None,
                delivery: Delivery::Json { status: 200, body },
            };
            self.report_usage(&result).await;
            return Ok(result);
        }

        // Plain JSON response.
        let (status, _headers, text) = response.collect_text().await?;
        let body: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));
        let parsed_usage = usage::extract_usage(&body).unwrap_or_default();
        let media = extract_media(&body);
        let result = ForwardResult {
            request_id: request.request_id.clone(),
            account_id: account.id,
            model: state.model.clone(),
            stream: false,
            usage: parsed_usage,
            duration_ms: started.elapsed().as_millis() as u64,
            first_token_ms: None,
            force_cache_billing: false,
            media_type: media.media_type,
            media_url: media.media_url.map(|u| sign_media_url(&u)),
            image_count: media.image_count,
            image_size: media.image_size,
            delivery: Delivery::Json { status, body },
        };
        self.report_usage(&result).await;
        Ok(result)
    }

    fn spawn_usage_reporter(
        &self,
        account_id: u64,
        request: &ForwardRequest,
        state: &AttemptState,
        started: Instant,
        outcome_rx: oneshot::Receiver<StreamOutcome>,
    ) -> oneshot::Receiver<StreamOutcome> {
        let (relay_tx, relay_rx) = oneshot::channel();
        let ops = self.ops.clone();
        let request_id = request.request_id.clone();
        let model = state.model.clone();
        tokio::spawn(async move {
            if let Ok(outcome) = outcome_rx.await {
                let record = UsageRecord {
                    request_id,
                    account_id,
                    model,
                    usage: outcome.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                    first_token_ms: outcome.first_token_ms,
                    stream: true,
                };
                if let Err(e) = ops.record_usage(record).await {
                    crate::logger::warn("forward", &format!("Usage report failed: {}", e));
                }
                let _ = relay_tx.send(outcome);
            }
        });
        relay_rx
    }

    async fn report_usage(&self, result: &ForwardResult) {
        if result.usage.is_empty() {
            return;
        }
        let record = UsageRecord {
            request_id: result.request_id.clone(),
            account_id: result.account_id,
            model: result.model.clone(),
            usage: result.usage,
            duration_ms: result.duration_ms,
            first_token_ms: result.first_token_ms,
            stream: result.stream,
        };
        if let Err(e) = self.ops.record_usage(record).await {
            crate::logger::warn("forward", &format!("Usage report failed: {}", e));
        }
    }
}

// ============================================================================
// Media helpers (Sora)
// ============================================================================

#[derive(Default)]
struct MediaFields {
    media_type: Option<String>,
    media_url: Option<String>,
    image_count: Option<u32>,
    image_size: Option<String>,
}

fn extract_media(body: &Value) -> MediaFields {
    let mut out = MediaFields::default();
    let Some(items) = body.get("data").and_then(|d| d.as_array()) else {
        return out;
    };
    if items.is_empty() {
        return out;
    }
    out.image_count = Some(items.len() as u32);
    if let Some(first) = items.first() {
        out.media_url = first
            .get("url")
            .and_then(|u| u.as_str())
            .map(|u| u.to_string());
        out.media_type = first
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());
        out.image_size = first
            .get("size")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
    }
    out
}

/// Append an expiring signature when a signing key is configured.
fn sign_media_url(url: &str) -> String {
    let cfg = config::load().gateway;
    let Some(key) = cfg.sora_media_signing_key.filter(|k| !k.is_empty()) else {
        return url.to_string();
    };
    let expires = Utc::now().timestamp() + cfg.sora_media_signed_url_ttl_seconds as i64;
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(url.as_bytes());
    hasher.update(expires.to_be_bytes());
    let sig = format!("{:x}", hasher.finalize());
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}exp={}&sig={}", url, sep, expires, sig)
}

// ============================================================================
// Gateway: scheduler + controller outer loop
// ============================================================================

pub struct Gateway {
    pub scheduler: Scheduler,
    pub controller: ForwardController,
    store: Arc<HealthStore>,
    url_tables: std::sync::Mutex<std::collections::HashMap<Platform, UrlAvailability>>,
}

impl Gateway {
    pub fn new(scheduler: Scheduler, controller: ForwardController, store: Arc<HealthStore>) -> Self {
        Self {
            scheduler,
            controller,
            store,
            url_tables: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn urls_for(&self, account: &Account) -> UrlAvailability {
        // Per-account overrides get their own private table.
        if account.credentials.get_str("base_url").is_some() {
            return UrlAvailability::from_config(base_urls(account));
        }
        let mut tables = self.url_tables.lock().expect("url table lock poisoned");
        tables
            .entry(account.platform)
            .or_insert_with(|| UrlAvailability::from_config(base_urls(account)))
            .clone()
    }

    /// Handle one client request end to end: pick, forward, and on a
    /// switch-account signal re-enter the scheduler excluding accounts
    /// already tried.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: ForwardRequest,
    ) -> GatewayResult<ForwardResult> {
        let mut excluded: HashSet<u64> = HashSet::new();
        let mut force_cache_billing = false;
        let mut last_failover_status = 502u16;

        loop {
            if ctx.is_cancelled() {
                return Err(GatewayError::Canceled);
            }

            let selection = match self.scheduler.pick_excluding(
                request.group_id,
                &request.model,
                request.sticky.as_ref(),
                &excluded,
            ) {
                Ok(selection) => selection,
                Err(GatewayError::NoCandidate { .. }) if !excluded.is_empty() => {
                    // Every candidate was tried; surface the last upstream
                    // failure instead of a generic no-candidate error.
                    return Err(GatewayError::Failover(UpstreamFailoverError {
                        status: last_failover_status,
                        force_cache_billing,
                    }));
                }
                Err(e) => return Err(e),
            };

            let account = selection.account.clone();
            force_cache_billing = force_cache_billing || selection.sticky_rejected;
            let urls = self.urls_for(&account);
            match self
                .controller
                .forward(ctx, account.clone(), &urls, &request, selection.sticky_reused)
                .await
            {
                Ok(mut result) => {
                    result.force_cache_billing = force_cache_billing;
                    if let Some(hint) = request.sticky.as_ref() {
                        let session = selection.session_uuid.unwrap_or_else(Uuid::new_v4);
                        self.store.sticky().save(
                            request.group_id,
                            &hint.prefix_hash,
                            &hint.digest_chain,
                            session,
                            account.id,
                        );
                    }
                    return Ok(result);
                }
                Err(GatewayError::Failover(failover)) => {
                    crate::logger::warn(
                        "gateway",
                        &format!(
                            "Failover from account {} (status {})",
                            account.id, failover.status
                        ),
                    );
                    excluded.insert(account.id);
                    force_cache_billing = force_cache_billing || failover.force_cache_billing;
                    last_failover_status = failover.status;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Heartbeat loop feeding the ops sink; returns the join handle. A zero
    /// interval disables it.
    pub fn spawn_heartbeat(
        ops: Arc<dyn OpsRepository>,
        node: String,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let interval_secs = config::load().concurrency.ping_interval;
        if interval_secs == 0 {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = ops.heartbeat(&node, Utc::now()).await {
                    crate::logger::warn("ops", &format!("Heartbeat failed: {}", e));
                }
            }
        }))
    }
}
