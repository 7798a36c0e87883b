//! Access-token provider
//!
//! Returns a usable access token for an account, refreshing OAuth
//! credentials when expiry is near. Refreshes for the same account are
//! single-flight: concurrent callers wait on the in-progress refresh and
//! then read the updated credential bag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::account::{Account, AccountType, CredentialBag};
use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthStore;

/// Refresh this close to expiry, in seconds.
const REFRESH_SAFETY_MARGIN_SECS: i64 = 60;

/// Provider-specific credential exchange: OAuth refresh-token grants and
/// session-cookie exchanges both land here. Returns the updated bag.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn refresh(&self, account: &Account) -> GatewayResult<CredentialBag>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_access_token(&self, account: &Account) -> GatewayResult<String>;
}

pub struct RefreshingTokenProvider {
    store: Arc<HealthStore>,
    exchanger: Arc<dyn TokenExchanger>,
    flights: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl RefreshingTokenProvider {
    pub fn new(store: Arc<HealthStore>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            store,
            exchanger,
            flights: Mutex::new(HashMap::new()),
        }
    }

    fn current_token(account: &Account) -> Option<String> {
        account
            .credentials
            .get_str("access_token")
            .or_else(|| account.credentials.get_str("api_key"))
    }

    fn needs_refresh(account: &Account) -> bool {
        match account.credentials.get_time("expires_at") {
            Some(expiry) => {
                Utc::now() + Duration::seconds(REFRESH_SAFETY_MARGIN_SECS) >= expiry
            }
            // Session-token credentials have no expiry until first exchange.
            None => Self::current_token(account).is_none(),
        }
    }

    async fn flight_lock(&self, account_id: u64) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn refresh_single_flight(&self, account: &Account) -> GatewayResult<String> {
        let lock = self.flight_lock(account.id).await;
        let _guard = lock.lock().await;

        // Another flight may have refreshed while we waited.
        if let Some(fresh) = self.store.cache().get(account.id) {
            if !Self::needs_refresh(&fresh) {
                if let Some(token) = Self::current_token(&fresh) {
                    return Ok(token);
                }
            }
        }

        crate::logger::info(
            "token",
            &format!("Refreshing credentials for account {}", account.id),
        );
        let snapshot = self
            .store
            .cache()
            .get(account.id)
            .map(|a| (*a).clone())
            .unwrap_or_else(|| account.clone());
        let updated = self.exchanger.refresh(&snapshot).await?;
        self.store.update_credentials(account.id, updated.clone()).await?;

        updated
            .get_str("access_token")
            .ok_or_else(|| GatewayError::UpstreamAuth("refresh returned no access token".into()))
    }
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn get_access_token(&self, account: &Account) -> GatewayResult<String> {
        match account.account_type {
            AccountType::ApiKey | AccountType::Upstream => Self::current_token(account)
                .ok_or_else(|| {
                    GatewayError::UpstreamAuth(format!(
                        "account {} has no API key configured",
                        account.id
                    ))
                }),
            AccountType::OAuth | AccountType::SetupToken => {
                if !Self::needs_refresh(account) {
                    if let Some(token) = Self::current_token(account) {
                        return Ok(token);
                    }
                }
                self.refresh_single_flight(account).await
            }
        }
    }
}

/// Token provider that only reads the stored credential; used where refresh
/// is handled out of band.
pub struct StaticTokenProvider;

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_access_token(&self, account: &Account) -> GatewayResult<String> {
        RefreshingTokenProvider::current_token(account).ok_or_else(|| {
            GatewayError::UpstreamAuth(format!("account {} has no access token", account.id))
        })
    }
}
