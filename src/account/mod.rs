//! Account model and schedulability predicates
//!
//! An [`Account`] is a credentialed upstream identity. The predicates here
//! are pure functions over a snapshot; all mutation goes through the health
//! store, which republishes snapshots to the scheduler cache.

pub mod credentials;
pub mod mapping;
pub mod validator;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub use credentials::CredentialBag;

/// Spend still allowed past the window cost limit for sticky continuations.
pub const WINDOW_COST_STICKY_RESERVE: f64 = 10.0;

/// Minutes of inactivity before a session window is considered idle.
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: i64 = 5;

/// Rolling accounting window length for Anthropic OAuth accounts.
pub const SESSION_WINDOW_HOURS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    OpenAI,
    Gemini,
    Antigravity,
    Sora,
}

impl Platform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Platform::Anthropic),
            "openai" | "codex" => Some(Platform::OpenAI),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            "sora" => Some(Platform::Sora),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAI => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
            Platform::Sora => "sora",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    OAuth,
    ApiKey,
    SetupToken,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Error,
    Disabled,
}

/// Provider-granted quota bucket on Antigravity, derived from the mapped
/// model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Claude,
    GeminiText,
    GeminiImage,
}

impl QuotaScope {
    pub fn for_model(model: &str) -> Option<Self> {
        if model.starts_with("claude-") {
            return Some(QuotaScope::Claude);
        }
        if model.starts_with("gemini-") {
            if model.contains("image") {
                return Some(QuotaScope::GeminiImage);
            }
            return Some(QuotaScope::GeminiText);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaScope::Claude => "claude",
            QuotaScope::GeminiText => "gemini_text",
            QuotaScope::GeminiImage => "gemini_image",
        }
    }
}

/// Active rate limit on one official model id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub limited_at: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionWindowStatus {
    Active,
    Expired,
}

/// Transient health owned by the account; mutated only through the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountHealth {
    pub last_used_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overloaded_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_reason: Option<String>,
    pub last_error: Option<String>,
    pub session_window_start: Option<DateTime<Utc>>,
    pub session_window_end: Option<DateTime<Utc>>,
    pub session_window_status: Option<SessionWindowStatus>,
    /// Official model id -> active limit. Flat side table, never nested in
    /// the extra bag.
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    /// Antigravity quota scope -> reset time.
    pub quota_scopes: HashMap<QuotaScope, DateTime<Utc>>,
}

/// How a window-cost-limited account may be scheduled right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCostSchedulability {
    Schedulable,
    StickyOnly,
    NotSchedulable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub platform: Platform,
    pub account_type: AccountType,
    pub credentials: CredentialBag,
    /// Non-credential operational flags (mixed scheduling, TLS fingerprint,
    /// window cost limit, ...).
    pub extra: CredentialBag,
    /// Higher first.
    pub priority: i32,
    /// Per-account in-flight ceiling; 0 means unlimited.
    pub concurrency: u32,
    /// Nullable multiplier; negatives are treated as 1.0 and 0 is legal.
    pub billing_rate: Option<f64>,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub groups: BTreeSet<u64>,
    pub proxy_url: Option<String>,
    pub health: AccountHealth,
}

impl Account {
    pub fn new(id: u64, name: &str, platform: Platform, account_type: AccountType) -> Self {
        Self {
            id,
            name: name.to_string(),
            platform,
            account_type,
            credentials: CredentialBag::new(),
            extra: CredentialBag::new(),
            priority: 0,
            concurrency: 0,
            billing_rate: None,
            status: AccountStatus::Active,
            schedulable: true,
            groups: BTreeSet::new(),
            proxy_url: None,
            health: AccountHealth::default(),
        }
    }

    pub fn billing_rate_multiplier(&self) -> f64 {
        match self.billing_rate {
            Some(rate) if rate >= 0.0 => rate,
            _ => 1.0,
        }
    }

    pub fn in_group(&self, group_id: u64) -> bool {
        self.groups.contains(&group_id)
    }

    pub fn mixed_scheduling(&self) -> bool {
        self.extra.get_bool("mixed_scheduling").unwrap_or(false)
    }

    pub fn tls_fingerprint_enabled(&self) -> bool {
        self.extra.get_bool("tls_fingerprint").unwrap_or(false)
    }

    pub fn custom_error_codes_enabled(&self) -> bool {
        self.extra
            .get_bool("custom_error_codes_enabled")
            .unwrap_or(false)
    }

    pub fn custom_error_codes(&self) -> Vec<u16> {
        self.extra.get_u16_list("custom_error_codes").unwrap_or_default()
    }

    pub fn window_cost_limit(&self) -> f64 {
        self.extra.get_f64("window_cost_limit").unwrap_or(0.0)
    }

    pub fn model_mapping(&self) -> HashMap<String, String> {
        self.credentials
            .get_string_map("model_mapping")
            .unwrap_or_default()
    }

    /// Resolve the official model id this account targets for `requested`.
    pub fn get_mapped_model(&self, requested: &str) -> String {
        mapping::resolve(self.platform, &self.model_mapping(), requested)
    }

    fn expired_for_auto_pause(&self, now: DateTime<Utc>) -> bool {
        if !self.extra.get_bool("auto_pause_on_expiry").unwrap_or(false) {
            return false;
        }
        match self.credentials.get_time("expires_at") {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }

    /// Base eligibility: active, flagged schedulable, and past every health
    /// window.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Active || !self.schedulable {
            return false;
        }
        if self.expired_for_auto_pause(now) {
            return false;
        }
        for until in [
            self.health.rate_limit_reset_at,
            self.health.overloaded_until,
            self.health.temp_unschedulable_until,
        ]
        .into_iter()
        .flatten()
        {
            if now < until {
                return false;
            }
        }
        true
    }

    /// Eligibility for one requested model: base schedulability, no active
    /// per-model limit on the resolved id, and (on Antigravity) a free quota
    /// scope.
    pub fn is_schedulable_for_model(&self, requested: &str, now: DateTime<Utc>) -> bool {
        if !self.is_schedulable(now) {
            return false;
        }

        let model_key = self.get_mapped_model(requested);
        if let Some(limit) = self.health.model_rate_limits.get(&model_key) {
            if now < limit.reset_at {
                return false;
            }
        }

        if self.platform == Platform::Antigravity {
            if let Some(scope) = QuotaScope::for_model(&model_key) {
                if let Some(reset) = self.health.quota_scopes.get(&scope) {
                    if now < *reset {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Classify against the window cost limit: under the limit is fully
    /// schedulable, within the reserve only sticky continuations are
    /// accepted, beyond that nothing is.
    pub fn window_cost_schedulability(&self, current_cost: f64) -> WindowCostSchedulability {
        let limit = self.window_cost_limit();
        if limit <= 0.0 || current_cost < limit {
            return WindowCostSchedulability::Schedulable;
        }
        if current_cost < limit + WINDOW_COST_STICKY_RESERVE {
            return WindowCostSchedulability::StickyOnly;
        }
        WindowCostSchedulability::NotSchedulable
    }

    /// Whether session-window accounting applies to this account.
    pub fn has_session_window(&self) -> bool {
        self.platform == Platform::Anthropic
            && matches!(
                self.account_type,
                AccountType::OAuth | AccountType::SetupToken
            )
    }

    /// Effective start of the rolling 5-hour window. Expired or unset
    /// windows restart at the current clock hour floor.
    pub fn effective_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour_floor = || {
            now.with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now)
        };
        match (self.health.session_window_start, self.health.session_window_end) {
            (Some(start), Some(end)) if now < end => start,
            _ => hour_floor(),
        }
    }

    pub fn effective_window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.effective_window_start(now) + Duration::hours(SESSION_WINDOW_HOURS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account() -> Account {
        Account::new(1, "test", Platform::Antigravity, AccountType::OAuth)
    }

    #[test]
    fn test_billing_rate_multiplier() {
        let mut acc = account();
        assert_eq!(acc.billing_rate_multiplier(), 1.0);
        acc.billing_rate = Some(0.0);
        assert_eq!(acc.billing_rate_multiplier(), 0.0);
        acc.billing_rate = Some(-2.0);
        assert_eq!(acc.billing_rate_multiplier(), 1.0);
        acc.billing_rate = Some(1.5);
        assert_eq!(acc.billing_rate_multiplier(), 1.5);
    }

    #[test]
    fn test_quota_scope_for_model() {
        assert_eq!(
            QuotaScope::for_model("claude-sonnet-4-5"),
            Some(QuotaScope::Claude)
        );
        assert_eq!(
            QuotaScope::for_model("gemini-2.5-pro"),
            Some(QuotaScope::GeminiText)
        );
        assert_eq!(
            QuotaScope::for_model("gemini-2.5-flash-image"),
            Some(QuotaScope::GeminiImage)
        );
        assert_eq!(QuotaScope::for_model("gpt-4"), None);
    }

    #[test]
    fn test_is_schedulable_health_windows() {
        let now = Utc::now();
        let mut acc = account();
        assert!(acc.is_schedulable(now));

        acc.health.rate_limit_reset_at = Some(now + Duration::seconds(30));
        assert!(!acc.is_schedulable(now));
        acc.health.rate_limit_reset_at = Some(now - Duration::seconds(30));
        assert!(acc.is_schedulable(now));

        acc.status = AccountStatus::Error;
        assert!(!acc.is_schedulable(now));
        acc.status = AccountStatus::Active;
        acc.schedulable = false;
        assert!(!acc.is_schedulable(now));
    }

    #[test]
    fn test_auto_pause_on_expiry() {
        let now = Utc::now();
        let mut acc = account();
        acc.credentials
            .insert("expires_at", json!((now - Duration::hours(1)).timestamp()));
        assert!(acc.is_schedulable(now));
        acc.extra.insert("auto_pause_on_expiry", json!(true));
        assert!(!acc.is_schedulable(now));
    }

    #[test]
    fn test_model_rate_limit_blocks_only_that_model() {
        let now = Utc::now();
        let mut acc = account();
        acc.health.model_rate_limits.insert(
            "claude-sonnet-4-5".to_string(),
            ModelRateLimit {
                limited_at: now,
                reset_at: now + Duration::seconds(15),
            },
        );
        assert!(!acc.is_schedulable_for_model("claude-sonnet-4-5", now));
        assert!(acc.is_schedulable_for_model("gemini-2.5-pro", now));
        // Expired limit no longer blocks.
        assert!(acc.is_schedulable_for_model("claude-sonnet-4-5", now + Duration::seconds(20)));
    }

    #[test]
    fn test_quota_scope_blocks_whole_scope() {
        let now = Utc::now();
        let mut acc = account();
        acc.health
            .quota_scopes
            .insert(QuotaScope::GeminiText, now + Duration::minutes(5));
        assert!(!acc.is_schedulable_for_model("gemini-2.5-pro", now));
        assert!(!acc.is_schedulable_for_model("gemini-2.5-flash", now));
        assert!(acc.is_schedulable_for_model("gemini-2.5-flash-image", now));
        assert!(acc.is_schedulable_for_model("claude-sonnet-4-5", now));
    }

    #[test]
    fn test_window_cost_classification() {
        let mut acc = account();
        assert_eq!(
            acc.window_cost_schedulability(1000.0),
            WindowCostSchedulability::Schedulable
        );
        acc.extra.insert("window_cost_limit", json!(50.0));
        assert_eq!(
            acc.window_cost_schedulability(49.0),
            WindowCostSchedulability::Schedulable
        );
        assert_eq!(
            acc.window_cost_schedulability(55.0),
            WindowCostSchedulability::StickyOnly
        );
        assert_eq!(
            acc.window_cost_schedulability(60.0),
            WindowCostSchedulability::NotSchedulable
        );
    }

    #[test]
    fn test_effective_window_start_defaults_to_hour_floor() {
        let now = Utc::now();
        let mut acc = Account::new(2, "anthropic", Platform::Anthropic, AccountType::OAuth);
        assert!(acc.has_session_window());

        let start = acc.effective_window_start(now);
        assert_eq!(start.minute(), 0);
        assert_eq!(start.second(), 0);
        assert!(start <= now);

        // A live window is honored.
        let live_start = now - Duration::hours(1);
        acc.health.session_window_start = Some(live_start);
        acc.health.session_window_end = Some(live_start + Duration::hours(5));
        assert_eq!(acc.effective_window_start(now), live_start);
        assert_eq!(
            acc.effective_window_end(now),
            live_start + Duration::hours(5)
        );
    }
}
