//! Account scheduler
//!
//! Stateless selection over the cache: rank the schedulable members of a
//! group for a requested model and pick one, honoring sticky sessions,
//! concurrency capacity and window-cost classification. All state lives in
//! the cache, the limiter and the sticky registry.

pub mod cache;
pub mod sticky;

use std::sync::Arc;

use chrono::Utc;

use crate::account::{Account, AccountType, Platform, WindowCostSchedulability};
use crate::error::{GatewayError, GatewayResult};
use crate::limits::ConcurrencyLimiter;

use cache::SchedulerCache;
use sticky::StickyRegistry;

/// Conversation fingerprint carried by a continuing client session.
#[derive(Debug, Clone, Default)]
pub struct StickyHint {
    pub prefix_hash: String,
    pub digest_chain: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account: Arc<Account>,
    pub sticky_reused: bool,
    /// A sticky binding existed but its account was rejected; the caller
    /// preserves cache accounting for the re-homed session.
    pub sticky_rejected: bool,
    /// Session uuid when the pick came from a sticky binding.
    pub session_uuid: Option<uuid::Uuid>,
}

/// Current spend inside an account's session window; billing supplies the
/// real numbers, tests and platforms without window limits use [`NoWindowCost`].
pub trait WindowCostSource: Send + Sync {
    fn current_cost(&self, account_id: u64) -> f64;
}

pub struct NoWindowCost;

impl WindowCostSource for NoWindowCost {
    fn current_cost(&self, _account_id: u64) -> f64 {
        0.0
    }
}

pub struct Scheduler {
    cache: SchedulerCache,
    sticky: StickyRegistry,
    limiter: ConcurrencyLimiter,
    window_cost: Arc<dyn WindowCostSource>,
}

impl Scheduler {
    pub fn new(
        cache: SchedulerCache,
        sticky: StickyRegistry,
        limiter: ConcurrencyLimiter,
        window_cost: Arc<dyn WindowCostSource>,
    ) -> Self {
        Self {
            cache,
            sticky,
            limiter,
            window_cost,
        }
    }

    /// Pick one account for `(group, model)`, preferring a still-valid sticky
    /// binding when a hint is present.
    pub fn pick(
        &self,
        group_id: u64,
        requested_model: &str,
        sticky_hint: Option<&StickyHint>,
    ) -> GatewayResult<Selection> {
        self.pick_excluding(group_id, requested_model, sticky_hint, &Default::default())
    }

    /// Like [`pick`](Self::pick), skipping accounts already tried for this
    /// request so a failover never returns to a failed account while others
    /// remain.
    pub fn pick_excluding(
        &self,
        group_id: u64,
        requested_model: &str,
        sticky_hint: Option<&StickyHint>,
        excluded: &std::collections::HashSet<u64>,
    ) -> GatewayResult<Selection> {
        let now = Utc::now();
        let mut sticky_rejected = false;

        if let Some(hint) = sticky_hint {
            if let Some(entry) = self.sticky.find(group_id, &hint.prefix_hash, &hint.digest_chain) {
                if let Some(account) = self.cache.get(entry.account_id) {
                    if !excluded.contains(&account.id)
                        && account.is_schedulable_for_model(requested_model, now)
                        && self.limiter.has_capacity(account.id, account.concurrency)
                        && self.window_cost_allows(&account, true)
                    {
                        crate::logger::debug(
                            "scheduler",
                            &format!(
                                "Sticky session reuse: group={}, account={}",
                                group_id, account.id
                            ),
                        );
                        return Ok(Selection {
                            account,
                            sticky_reused: true,
                            sticky_rejected: false,
                            session_uuid: Some(entry.session_uuid),
                        });
                    }
                }
                sticky_rejected = true;
            }
        }

        let members = self.cache.get_by_group(group_id);
        let pure_antigravity = !members.is_empty()
            && members.iter().all(|a| a.platform == Platform::Antigravity);

        let mut candidates: Vec<Arc<Account>> = members
            .into_iter()
            .filter(|a| !excluded.contains(&a.id))
            .filter(|a| a.is_schedulable_for_model(requested_model, now))
            .filter(|a| self.limiter.has_capacity(a.id, a.concurrency))
            .filter(|a| self.platform_allowed(a, pure_antigravity))
            .filter(|a| self.window_cost_allows(a, sticky_hint.is_some()))
            .collect();

        if candidates.is_empty() {
            crate::logger::warn(
                "scheduler",
                &format!(
                    "No schedulable account: group={}, model={}",
                    group_id, requested_model
                ),
            );
            return Err(GatewayError::NoCandidate { group_id });
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    self.limiter
                        .in_flight(a.id)
                        .cmp(&self.limiter.in_flight(b.id))
                })
                .then_with(|| match (a.health.last_used_at, b.health.last_used_at) {
                    (Some(at), Some(bt)) => at.cmp(&bt),
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let account = candidates.remove(0);
        crate::logger::info(
            "scheduler",
            &format!(
                "Selected account: group={}, model={}, account={} (priority {})",
                group_id, requested_model, account.id, account.priority
            ),
        );

        Ok(Selection {
            account,
            sticky_reused: false,
            sticky_rejected,
            session_uuid: None,
        })
    }

    /// Antigravity accounts join mixed groups only when their mixed
    /// scheduling flag says so; pure antigravity groups always qualify.
    fn platform_allowed(&self, account: &Account, pure_antigravity: bool) -> bool {
        if account.platform != Platform::Antigravity {
            return true;
        }
        pure_antigravity || account.mixed_scheduling()
    }

    fn window_cost_allows(&self, account: &Account, has_sticky_hint: bool) -> bool {
        if !(account.platform == Platform::Anthropic
            && matches!(account.account_type, AccountType::OAuth | AccountType::SetupToken))
        {
            return true;
        }
        if account.window_cost_limit() <= 0.0 {
            return true;
        }
        let cost = self.window_cost.current_cost(account.id);
        match account.window_cost_schedulability(cost) {
            WindowCostSchedulability::Schedulable => true,
            WindowCostSchedulability::StickyOnly => has_sticky_hint,
            WindowCostSchedulability::NotSchedulable => false,
        }
    }
}
