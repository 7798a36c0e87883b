//! Account health store
//!
//! All limit and health mutations funnel through [`HealthStore`]: the change
//! is applied to the store's private copy, persisted through the account
//! repository, and republished to the scheduler cache as a fresh snapshot.
//! Mutations that make an account non-schedulable also invalidate its sticky
//! sessions. One writer at a time per store keeps per-account mutations
//! linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::account::{
    Account, AccountStatus, ModelRateLimit, QuotaScope, SessionWindowStatus,
};
use crate::error::{GatewayError, GatewayResult};
use crate::limits::ConcurrencyLimiter;
use crate::repo::AccountRepository;
use crate::scheduler::cache::SchedulerCache;
use crate::scheduler::sticky::StickyRegistry;

pub struct HealthStore {
    accounts: Mutex<HashMap<u64, Account>>,
    cache: SchedulerCache,
    sticky: StickyRegistry,
    repo: Arc<dyn AccountRepository>,
}

impl HealthStore {
    pub fn new(
        cache: SchedulerCache,
        sticky: StickyRegistry,
        repo: Arc<dyn AccountRepository>,
    ) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            cache,
            sticky,
            repo,
        }
    }

    /// Seed the store and cache with a full account list.
    pub async fn load(&self, accounts: Vec<Account>) {
        let mut guard = self.accounts.lock().await;
        for account in accounts {
            self.cache.set_account(account.clone());
            guard.insert(account.id, account);
        }
    }

    pub fn cache(&self) -> &SchedulerCache {
        &self.cache
    }

    pub fn sticky(&self) -> &StickyRegistry {
        &self.sticky
    }

    async fn mutate<F>(&self, id: u64, invalidate_sticky: bool, f: F) -> GatewayResult<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut guard = self.accounts.lock().await;
        let account = guard
            .get_mut(&id)
            .ok_or_else(|| GatewayError::Repository(format!("unknown account {}", id)))?;
        f(account);
        let snapshot = account.clone();
        drop(guard);

        self.cache.set_account(snapshot);
        if invalidate_sticky {
            self.sticky.invalidate(id, None);
        }
        Ok(())
    }

    /// Account-wide rate limit until `reset_at`.
    pub async fn set_rate_limited(&self, id: u64, reset_at: DateTime<Utc>) -> GatewayResult<()> {
        self.repo.set_rate_limited(id, reset_at).await?;
        crate::logger::info(
            "health",
            &format!("Account {} rate limited until {}", id, reset_at),
        );
        self.mutate(id, true, |a| a.health.rate_limit_reset_at = Some(reset_at))
            .await
    }

    pub async fn set_overloaded(&self, id: u64, until: DateTime<Utc>) -> GatewayResult<()> {
        self.repo.set_overloaded(id, until).await?;
        crate::logger::info("health", &format!("Account {} overloaded until {}", id, until));
        self.mutate(id, true, |a| a.health.overloaded_until = Some(until))
            .await
    }

    pub async fn set_temp_unschedulable(
        &self,
        id: u64,
        until: DateTime<Utc>,
        reason: &str,
    ) -> GatewayResult<()> {
        self.repo.set_temp_unschedulable(id, until, reason).await?;
        crate::logger::warn(
            "health",
            &format!(
                "Account {} temporarily unschedulable until {} ({})",
                id, until, reason
            ),
        );
        let reason = reason.to_string();
        self.mutate(id, true, move |a| {
            a.health.temp_unschedulable_until = Some(until);
            a.health.temp_unschedulable_reason = Some(reason);
        })
        .await
    }

    /// Transition to error status; scheduling stops until an operator
    /// reactivates the account.
    pub async fn set_error(&self, id: u64, message: &str) -> GatewayResult<()> {
        self.repo.set_error(id, message).await?;
        crate::logger::error("health", &format!("Account {} errored: {}", id, message));
        let message = message.to_string();
        self.mutate(id, true, move |a| {
            a.status = AccountStatus::Error;
            a.health.last_error = Some(message);
        })
        .await
    }

    pub async fn set_quota_scope_limit(
        &self,
        id: u64,
        scope: QuotaScope,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.repo.set_quota_scope_limit(id, scope, reset_at).await?;
        crate::logger::info(
            "health",
            &format!(
                "Account {} quota scope {} limited until {}",
                id,
                scope.as_str(),
                reset_at
            ),
        );
        self.mutate(id, true, move |a| {
            a.health.quota_scopes.insert(scope, reset_at);
        })
        .await
    }

    /// Install a per-model limit. `model_key` must be an official provider
    /// model id; scope names are a caller bug and are rejected.
    pub async fn set_model_rate_limit(
        &self,
        id: u64,
        model_key: &str,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        if matches!(model_key, "claude" | "gemini_text" | "gemini_image") {
            return Err(GatewayError::Internal(format!(
                "model rate limit requires a model id, got quota scope '{}'",
                model_key
            )));
        }

        self.repo.set_model_rate_limit(id, model_key, reset_at).await?;
        let now = Utc::now();
        crate::logger::info(
            "health",
            &format!(
                "Account {} model {} rate limited until {}",
                id, model_key, reset_at
            ),
        );

        let threshold = Duration::seconds(
            crate::config::load().retry.smart_retry_threshold_seconds as i64,
        );
        let invalidate = reset_at - now >= threshold;

        let key = model_key.to_string();
        let model_for_sticky = model_key.to_string();
        self.mutate(id, false, move |a| {
            a.health.model_rate_limits.insert(
                key,
                ModelRateLimit {
                    limited_at: now,
                    reset_at,
                },
            );
        })
        .await?;

        // Short limits are waited out in place; only a limit the scheduler
        // cannot outwait breaks session affinity.
        if invalidate {
            self.sticky.invalidate(id, Some(&model_for_sticky));
        }
        Ok(())
    }

    pub async fn update_session_window(
        &self,
        id: u64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        status: Option<SessionWindowStatus>,
    ) -> GatewayResult<()> {
        self.repo.update_session_window(id, start, end, status).await?;
        self.mutate(id, false, move |a| {
            a.health.session_window_start = start;
            a.health.session_window_end = end;
            a.health.session_window_status = status;
        })
        .await
    }

    pub async fn touch_last_used(&self, id: u64) -> GatewayResult<()> {
        let now = Utc::now();
        self.repo.touch_last_used(id, now).await?;
        self.mutate(id, false, move |a| a.health.last_used_at = Some(now))
            .await
    }

    pub async fn update_credentials(
        &self,
        id: u64,
        credentials: crate::account::CredentialBag,
    ) -> GatewayResult<()> {
        self.repo.update_credentials(id, credentials.clone()).await?;
        self.mutate(id, false, move |a| a.credentials = credentials)
            .await
    }

    /// Drop expired limit windows so the health surface stays readable.
    /// Predicates already ignore expired windows; this is housekeeping.
    pub async fn prune_expired(&self) {
        let now = Utc::now();
        let ids: Vec<u64> = {
            let guard = self.accounts.lock().await;
            guard.keys().copied().collect()
        };
        for id in ids {
            let _ = self
                .mutate(id, false, |a| {
                    let h = &mut a.health;
                    if h.rate_limit_reset_at.map(|t| t <= now).unwrap_or(false) {
                        h.rate_limit_reset_at = None;
                    }
                    if h.overloaded_until.map(|t| t <= now).unwrap_or(false) {
                        h.overloaded_until = None;
                    }
                    if h.temp_unschedulable_until.map(|t| t <= now).unwrap_or(false) {
                        h.temp_unschedulable_until = None;
                        h.temp_unschedulable_reason = None;
                    }
                    h.model_rate_limits.retain(|_, l| l.reset_at > now);
                    h.quota_scopes.retain(|_, reset| *reset > now);
                })
                .await;
        }
    }

    /// Health snapshot for dashboards and failover strategies. No policy
    /// decisions here.
    pub async fn report(&self, limiter: &ConcurrencyLimiter) -> HealthReport {
        let now = Utc::now();
        let guard = self.accounts.lock().await;
        let in_flight = limiter.snapshot();
        let mut accounts: Vec<AccountHealthSummary> = guard
            .values()
            .map(|a| AccountHealthSummary {
                account_id: a.id,
                name: a.name.clone(),
                platform: a.platform,
                status: a.status,
                schedulable_now: a.is_schedulable(now),
                rate_limit_reset_at: a.health.rate_limit_reset_at,
                overloaded_until: a.health.overloaded_until,
                temp_unschedulable_until: a.health.temp_unschedulable_until,
                temp_unschedulable_reason: a.health.temp_unschedulable_reason.clone(),
                model_rate_limits: a
                    .health
                    .model_rate_limits
                    .iter()
                    .filter(|(_, l)| l.reset_at > now)
                    .map(|(m, l)| (m.clone(), l.reset_at))
                    .collect(),
                quota_scopes: a
                    .health
                    .quota_scopes
                    .iter()
                    .filter(|(_, reset)| **reset > now)
                    .map(|(s, reset)| (*s, *reset))
                    .collect(),
                window_cost_limit: a.window_cost_limit(),
                last_error: a.health.last_error.clone(),
                in_flight: in_flight.get(&a.id).copied().unwrap_or(0),
                concurrency: a.concurrency,
            })
            .collect();
        accounts.sort_by_key(|a| a.account_id);
        HealthReport {
            generated_at: now,
            accounts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountHealthSummary {
    pub account_id: u64,
    pub name: String,
    pub platform: crate::account::Platform,
    pub status: AccountStatus,
    pub schedulable_now: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub overloaded_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_until: Option<DateTime<Utc>>,
    pub temp_unschedulable_reason: Option<String>,
    pub model_rate_limits: Vec<(String, DateTime<Utc>)>,
    pub quota_scopes: Vec<(QuotaScope, DateTime<Utc>)>,
    pub window_cost_limit: f64,
    pub last_error: Option<String>,
    pub in_flight: u32,
    pub concurrency: u32,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub accounts: Vec<AccountHealthSummary>,
}
