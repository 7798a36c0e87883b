//! Persistence collaborator interfaces
//!
//! The core never talks to a database directly; it goes through these
//! traits. Production wiring supplies real implementations, tests use the
//! in-memory ones below.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::{Account, CredentialBag, QuotaScope, SessionWindowStatus};
use crate::error::GatewayResult;
use crate::forward::usage::Usage;

/// Account reads plus the health mutations of the limit store. Mutations are
/// linearized per account by the caller.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_by_id(&self, id: u64) -> GatewayResult<Option<Account>>;
    async fn list_by_group(&self, group_id: u64) -> GatewayResult<Vec<Account>>;

    async fn set_rate_limited(&self, id: u64, reset_at: DateTime<Utc>) -> GatewayResult<()>;
    async fn set_overloaded(&self, id: u64, until: DateTime<Utc>) -> GatewayResult<()>;
    async fn set_temp_unschedulable(
        &self,
        id: u64,
        until: DateTime<Utc>,
        reason: &str,
    ) -> GatewayResult<()>;
    async fn set_error(&self, id: u64, message: &str) -> GatewayResult<()>;
    async fn set_quota_scope_limit(
        &self,
        id: u64,
        scope: QuotaScope,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()>;
    async fn set_model_rate_limit(
        &self,
        id: u64,
        model_key: &str,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()>;
    async fn update_session_window(
        &self,
        id: u64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        status: Option<SessionWindowStatus>,
    ) -> GatewayResult<()>;
    async fn update_credentials(&self, id: u64, credentials: CredentialBag) -> GatewayResult<()>;
    async fn touch_last_used(&self, id: u64, at: DateTime<Utc>) -> GatewayResult<()>;
}

/// Completed-request record handed to the ops sink.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub account_id: u64,
    pub model: String,
    pub usage: Usage,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    pub stream: bool,
}

/// Structured operational event.
#[derive(Debug, Clone)]
pub struct OpsEvent {
    pub kind: String,
    pub account_id: Option<u64>,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Write-only sink for heartbeats, events and usage records.
#[async_trait]
pub trait OpsRepository: Send + Sync {
    async fn heartbeat(&self, node: &str, at: DateTime<Utc>) -> GatewayResult<()>;
    async fn record_event(&self, event: OpsEvent) -> GatewayResult<()>;
    async fn record_usage(&self, record: UsageRecord) -> GatewayResult<()>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Account repository over a mutexed map. Backs unit tests and the
/// single-node run mode.
#[derive(Default)]
pub struct MemoryAccountRepository {
    accounts: Mutex<HashMap<u64, Account>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, accounts: Vec<Account>) {
        let mut guard = self.accounts.lock().expect("account map poisoned");
        for account in accounts {
            guard.insert(account.id, account);
        }
    }

    fn with_account<F>(&self, id: u64, f: F) -> GatewayResult<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut guard = self.accounts.lock().expect("account map poisoned");
        if let Some(account) = guard.get_mut(&id) {
            f(account);
        }
        Ok(())
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn get_by_id(&self, id: u64) -> GatewayResult<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .expect("account map poisoned")
            .get(&id)
            .cloned())
    }

    async fn list_by_group(&self, group_id: u64) -> GatewayResult<Vec<Account>> {
        Ok(self
            .accounts
            .lock()
            .expect("account map poisoned")
            .values()
            .filter(|a| a.in_group(group_id))
            .cloned()
            .collect())
    }

    async fn set_rate_limited(&self, id: u64, reset_at: DateTime<Utc>) -> GatewayResult<()> {
        self.with_account(id, |a| a.health.rate_limit_reset_at = Some(reset_at))
    }

    async fn set_overloaded(&self, id: u64, until: DateTime<Utc>) -> GatewayResult<()> {
        self.with_account(id, |a| a.health.overloaded_until = Some(until))
    }

    async fn set_temp_unschedulable(
        &self,
        id: u64,
        until: DateTime<Utc>,
        reason: &str,
    ) -> GatewayResult<()> {
        self.with_account(id, |a| {
            a.health.temp_unschedulable_until = Some(until);
            a.health.temp_unschedulable_reason = Some(reason.to_string());
        })
    }

    async fn set_error(&self, id: u64, message: &str) -> GatewayResult<()> {
        self.with_account(id, |a| {
            a.status = crate::account::AccountStatus::Error;
            a.health.last_error = Some(message.to_string());
        })
    }

    async fn set_quota_scope_limit(
        &self,
        id: u64,
        scope: QuotaScope,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.with_account(id, |a| {
            a.health.quota_scopes.insert(scope, reset_at);
        })
    }

    async fn set_model_rate_limit(
        &self,
        id: u64,
        model_key: &str,
        reset_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let now = Utc::now();
        self.with_account(id, |a| {
            a.health.model_rate_limits.insert(
                model_key.to_string(),
                crate::account::ModelRateLimit {
                    limited_at: now,
                    reset_at,
                },
            );
        })
    }

    async fn update_session_window(
        &self,
        id: u64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        status: Option<SessionWindowStatus>,
    ) -> GatewayResult<()> {
        self.with_account(id, |a| {
            a.health.session_window_start = start;
            a.health.session_window_end = end;
            a.health.session_window_status = status;
        })
    }

    async fn update_credentials(&self, id: u64, credentials: CredentialBag) -> GatewayResult<()> {
        self.with_account(id, |a| a.credentials = credentials)
    }

    async fn touch_last_used(&self, id: u64, at: DateTime<Utc>) -> GatewayResult<()> {
        self.with_account(id, |a| a.health.last_used_at = Some(at))
    }
}

/// Ops sink that buffers everything in memory.
#[derive(Default)]
pub struct MemoryOpsRepository {
    pub events: Mutex<Vec<OpsEvent>>,
    pub usage: Mutex<Vec<UsageRecord>>,
    pub heartbeats: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl MemoryOpsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpsRepository for MemoryOpsRepository {
    async fn heartbeat(&self, node: &str, at: DateTime<Utc>) -> GatewayResult<()> {
        self.heartbeats
            .lock()
            .expect("heartbeat buffer poisoned")
            .push((node.to_string(), at));
        Ok(())
    }

    async fn record_event(&self, event: OpsEvent) -> GatewayResult<()> {
        self.events
            .lock()
            .expect("event buffer poisoned")
            .push(event);
        Ok(())
    }

    async fn record_usage(&self, record: UsageRecord) -> GatewayResult<()> {
        self.usage
            .lock()
            .expect("usage buffer poisoned")
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountType, Platform};

    #[tokio::test]
    async fn test_memory_repo_round_trip() {
        let repo = MemoryAccountRepository::new();
        let mut acc = Account::new(1, "a", Platform::Anthropic, AccountType::OAuth);
        acc.groups.insert(10);
        repo.seed(vec![acc]);

        let loaded = repo.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(loaded.name, "a");
        assert_eq!(repo.list_by_group(10).await.unwrap().len(), 1);
        assert!(repo.list_by_group(11).await.unwrap().is_empty());

        let reset = Utc::now() + chrono::Duration::seconds(60);
        repo.set_rate_limited(1, reset).await.unwrap();
        let loaded = repo.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(loaded.health.rate_limit_reset_at, Some(reset));
    }

    #[tokio::test]
    async fn test_set_error_transitions_status() {
        let repo = MemoryAccountRepository::new();
        repo.seed(vec![Account::new(1, "a", Platform::Anthropic, AccountType::ApiKey)]);
        repo.set_error(1, "invalid key").await.unwrap();
        let loaded = repo.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, crate::account::AccountStatus::Error);
        assert_eq!(loaded.health.last_error.as_deref(), Some("invalid key"));
    }
}
