//! Scheduler cache
//!
//! Indexed snapshot of all accounts for fast selection. Readers never see an
//! account mid-mutation: the health store mutates a private copy and
//! republishes it here as a fresh `Arc`, swapping the whole snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::account::Account;

#[derive(Default)]
struct CacheInner {
    by_id: HashMap<u64, Arc<Account>>,
    by_group: HashMap<u64, Vec<u64>>,
}

#[derive(Clone, Default)]
pub struct SchedulerCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl SchedulerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) one account snapshot and refresh group indexes.
    pub fn set_account(&self, account: Account) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let id = account.id;
        let groups = account.groups.clone();
        inner.by_id.insert(id, Arc::new(account));

        for ids in inner.by_group.values_mut() {
            ids.retain(|existing| *existing != id);
        }
        for group in groups {
            inner.by_group.entry(group).or_default().push(id);
        }
        inner.by_group.retain(|_, ids| !ids.is_empty());
    }

    /// Drop an account from the cache entirely.
    pub fn remove_account(&self, account_id: u64) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        inner.by_id.remove(&account_id);
        for ids in inner.by_group.values_mut() {
            ids.retain(|existing| *existing != account_id);
        }
        inner.by_group.retain(|_, ids| !ids.is_empty());
    }

    pub fn get(&self, account_id: u64) -> Option<Arc<Account>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_id.get(&account_id).cloned())
    }

    /// Snapshots of every member of a group.
    pub fn get_by_group(&self, group_id: u64) -> Vec<Arc<Account>> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };
        inner
            .by_group
            .get(&group_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<Account>> {
        self.inner
            .read()
            .map(|inner| inner.by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
