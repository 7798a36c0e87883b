//! Gateway configuration
//!
//! Settings are loaded once from `gateway.toml` in the platform config
//! directory (override with `RELAY_GATEWAY_CONFIG`) and cached behind a
//! process-wide lock. Callers always go through [`load`]; `reload` swaps the
//! cached snapshot after an operator edit.

use std::{fs, path::PathBuf, sync::RwLock};

use once_cell::sync::Lazy;

#[derive(serde::Serialize, serde::Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewayConfig,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub idempotency: IdempotencyConfig,
    pub usage_cleanup: UsageCleanupConfig,
    pub ops: OpsConfig,
    /// Proxy configuration for upstream HTTP requests.
    pub proxy: Option<ProxyConfig>,
    /// Keyword rules that temporarily remove an account from scheduling.
    pub temp_unschedulable_rules: Vec<TempUnschedulableRule>,
    /// Rules that remap selected upstream errors into fixed client responses.
    pub pass_through_rules: Vec<PassThroughRule>,
    /// `simple` disables the distributed system-operation lock.
    pub run_mode: Option<String>,
    /// IANA timezone used for window accounting; `Local` when unset.
    pub timezone: Option<String>,
    /// Minimum log level persisted by the logger ("debug".."error").
    pub log_level: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hard cap on a single SSE line, in bytes.
    pub max_line_size: usize,
    /// Seconds without upstream data before a stream is aborted; 0 disables.
    pub stream_data_interval_timeout: u64,
    pub sora_request_timeout_seconds: u64,
    pub sora_stream_timeout_seconds: u64,
    /// When set, upstream error bodies are logged (truncated).
    pub log_upstream_error_body: bool,
    pub log_upstream_error_body_max_bytes: usize,
    pub sora_media_signing_key: Option<String>,
    pub sora_media_signed_url_ttl_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_line_size: 64 * 1024,
            stream_data_interval_timeout: 0,
            sora_request_timeout_seconds: 120,
            sora_stream_timeout_seconds: 600,
            log_upstream_error_body: false,
            log_upstream_error_body_max_bytes: 2048,
            sora_media_signing_key: None,
            sora_media_signed_url_ttl_seconds: 900,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum HTTP attempts per account per URL.
    pub max_attempts: u32,
    /// Base for the exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_delay_ms: u64,
    /// Seconds a base URL stays sidelined after a connection error or 429.
    pub url_unavailable_seconds: u64,
    /// Per-model limits shorter than this are waited out in place, in seconds.
    pub smart_retry_threshold_seconds: u64,
    /// In-place retries allowed on a short provider rate-limit hint.
    pub smart_retry_max: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 16_000,
            url_unavailable_seconds: 60,
            smart_retry_threshold_seconds: 7,
            smart_retry_max: 3,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Heartbeat interval for the ops sink, in seconds; 0 disables.
    pub ping_interval: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { ping_interval: 30 }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub cleanup_interval_seconds: u64,
    pub cleanup_batch_size: u32,
    /// Size cap for stored success bodies, in bytes.
    pub max_response_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 300,
            cleanup_batch_size: 500,
            max_response_bytes: 256 * 1024,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct UsageCleanupConfig {
    pub enabled: bool,
    pub max_range_days: u32,
    pub batch_size: u32,
    pub worker_interval_seconds: u64,
    pub task_timeout_seconds: u64,
}

impl Default for UsageCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_range_days: 31,
            batch_size: 5000,
            worker_interval_seconds: 10,
            task_timeout_seconds: 1800,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct OpsConfig {
    pub enabled: bool,
    pub aggregation: OpsAggregationConfig,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct OpsAggregationConfig {
    pub enabled: bool,
}

/// Proxy configuration
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProxyConfig {
    /// Enable proxy for upstream requests
    pub enabled: bool,

    /// Proxy URL (e.g., "http://127.0.0.1:8080")
    pub url: Option<String>,

    /// Proxy username (optional)
    pub username: Option<String>,

    /// Proxy password (optional)
    pub password: Option<String>,

    /// List of hosts/patterns to bypass proxy (e.g., ["localhost", "127.0.0.1"])
    pub bypass: Option<Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            username: None,
            password: None,
            bypass: None,
        }
    }
}

/// Removes an account from scheduling for a fixed window when an upstream
/// error matches on status code and body keyword.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct TempUnschedulableRule {
    pub error_code: u16,
    pub keywords: Vec<String>,
    pub duration_minutes: u32,
    pub description: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMatchMode {
    #[default]
    Any,
    All,
}

/// Remaps a matching upstream error into a fixed client-visible response.
/// A matching rule suppresses failover.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PassThroughRule {
    pub status: u16,
    pub keywords: Vec<String>,
    pub match_mode: KeywordMatchMode,
    pub response_code: u16,
    pub response_type: Option<String>,
    pub message: String,
}

impl PassThroughRule {
    pub fn matches(&self, status: u16, body: &str) -> bool {
        if status != self.status {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }
        let lower = body.to_lowercase();
        match self.match_mode {
            KeywordMatchMode::Any => self
                .keywords
                .iter()
                .any(|k| lower.contains(&k.to_lowercase())),
            KeywordMatchMode::All => self
                .keywords
                .iter()
                .all(|k| lower.contains(&k.to_lowercase())),
        }
    }
}

impl Settings {
    pub fn run_mode_simple(&self) -> bool {
        self.run_mode
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case("simple"))
            .unwrap_or(false)
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RELAY_GATEWAY_CONFIG") {
        return PathBuf::from(path);
    }
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("relay-gateway");
    dir.push("gateway.toml");
    dir
}

fn read_settings() -> Settings {
    let path = config_path();
    match fs::read_to_string(&path) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                crate::logger::warn(
                    "config",
                    &format!("Failed to parse {}: {}; using defaults", path.display(), e),
                );
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(read_settings()));

/// Current settings snapshot.
pub fn load() -> Settings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

/// Re-read the config file and publish the new snapshot.
pub fn reload() {
    let fresh = read_settings();
    if let Ok(mut guard) = SETTINGS.write() {
        *guard = fresh;
    }
}

/// Replace the cached settings directly (tests and embedders).
pub fn replace(settings: Settings) {
    if let Ok(mut guard) = SETTINGS.write() {
        *guard = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.gateway.max_line_size, 64 * 1024);
        assert_eq!(s.gateway.stream_data_interval_timeout, 0);
        assert_eq!(s.usage_cleanup.max_range_days, 31);
        assert_eq!(s.usage_cleanup.batch_size, 5000);
        assert_eq!(s.retry.smart_retry_threshold_seconds, 7);
        assert!(!s.run_mode_simple());
    }

    #[test]
    fn test_run_mode_simple() {
        let mut s = Settings::default();
        s.run_mode = Some("Simple".to_string());
        assert!(s.run_mode_simple());
    }

    #[test]
    fn test_pass_through_rule_match() {
        let rule = PassThroughRule {
            status: 403,
            keywords: vec!["quota".to_string(), "billing".to_string()],
            match_mode: KeywordMatchMode::Any,
            response_code: 429,
            response_type: Some("rate_limit_error".to_string()),
            message: "Upstream quota exhausted".to_string(),
        };
        assert!(rule.matches(403, "Your QUOTA has been used up"));
        assert!(!rule.matches(403, "forbidden"));
        assert!(!rule.matches(500, "quota"));

        let all = PassThroughRule {
            match_mode: KeywordMatchMode::All,
            ..rule.clone()
        };
        assert!(!all.matches(403, "quota only"));
        assert!(all.matches(403, "quota and billing issue"));
    }
}
