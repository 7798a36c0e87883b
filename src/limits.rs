//! Per-account concurrency limiting
//!
//! An atomic in-flight counter per account. Acquire on attempt start,
//! release when the guard drops. There is no queue: when an account is at
//! capacity the scheduler simply picks a different one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LimitState {
    in_flight: HashMap<u64, u32>,
}

/// Shared per-account in-flight counters.
#[derive(Clone, Default)]
pub struct ConcurrencyLimiter {
    state: Arc<Mutex<LimitState>>,
}

/// Holds one in-flight slot; dropping it releases the slot.
pub struct ConcurrencyGuard {
    account_id: u64,
    state: Arc<Mutex<LimitState>>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.state.lock() {
            if let Some(count) = guard.in_flight.get_mut(&self.account_id) {
                if *count > 0 {
                    *count -= 1;
                }
                if *count == 0 {
                    guard.in_flight.remove(&self.account_id);
                }
            }
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for an account.
    pub fn in_flight(&self, account_id: u64) -> u32 {
        self.state
            .lock()
            .map(|s| s.in_flight.get(&account_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether one more request would fit. `capacity` 0 means unlimited.
    pub fn has_capacity(&self, account_id: u64, capacity: u32) -> bool {
        capacity == 0 || self.in_flight(account_id) < capacity
    }

    /// Try to take a slot; `None` when the account is at capacity.
    pub fn acquire(&self, account_id: u64, capacity: u32) -> Option<ConcurrencyGuard> {
        let mut guard = self.state.lock().ok()?;
        let count = guard.in_flight.entry(account_id).or_insert(0);
        if capacity != 0 && *count >= capacity {
            crate::logger::debug(
                "limits",
                &format!(
                    "Account {} at capacity: {}/{} in-flight",
                    account_id, count, capacity
                ),
            );
            return None;
        }
        *count += 1;
        Some(ConcurrencyGuard {
            account_id,
            state: Arc::clone(&self.state),
        })
    }

    /// Snapshot of all non-zero counters, for the health surface.
    pub fn snapshot(&self) -> HashMap<u64, u32> {
        self.state
            .lock()
            .map(|s| s.in_flight.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let limiter = ConcurrencyLimiter::new();
        let g1 = limiter.acquire(1, 2).unwrap();
        let g2 = limiter.acquire(1, 2).unwrap();
        assert_eq!(limiter.in_flight(1), 2);
        assert!(limiter.acquire(1, 2).is_none());

        drop(g1);
        assert_eq!(limiter.in_flight(1), 1);
        let g3 = limiter.acquire(1, 2).unwrap();
        assert_eq!(limiter.in_flight(1), 2);

        drop(g2);
        drop(g3);
        assert_eq!(limiter.in_flight(1), 0);
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let limiter = ConcurrencyLimiter::new();
        let guards: Vec<_> = (0..100).filter_map(|_| limiter.acquire(7, 0)).collect();
        assert_eq!(guards.len(), 100);
        assert!(limiter.has_capacity(7, 0));
    }

    #[test]
    fn test_accounts_are_independent() {
        let limiter = ConcurrencyLimiter::new();
        let _g = limiter.acquire(1, 1).unwrap();
        assert!(!limiter.has_capacity(1, 1));
        assert!(limiter.has_capacity(2, 1));
        assert!(limiter.acquire(2, 1).is_some());
    }

    #[test]
    fn test_snapshot_reports_counts() {
        let limiter = ConcurrencyLimiter::new();
        let _a = limiter.acquire(1, 0).unwrap();
        let _b = limiter.acquire(1, 0).unwrap();
        let _c = limiter.acquire(2, 0).unwrap();
        let snap = limiter.snapshot();
        assert_eq!(snap.get(&1), Some(&2));
        assert_eq!(snap.get(&2), Some(&1));
    }
}
