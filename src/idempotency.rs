//! Idempotency coordination
//!
//! Single-flight guarantee over mutating operations: the first caller with a
//! key runs the executor, everyone else replays the stored success or gets a
//! retryable conflict. Records are fingerprinted over (method, route, actor,
//! canonical payload) so a reused key with a different payload can never
//! replay a stale response. A lease renewer keeps long executors locked, and
//! a system-operation variant wraps cluster-wide maintenance actions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config;
use crate::error::{GatewayError, GatewayResult};

/// Lock lease on a processing record.
const PROCESSING_LEASE: Duration = Duration::from_secs(30);

/// Backoff window stored with a retryable failure.
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);

pub const MAX_KEY_LENGTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Processing,
    Succeeded,
    FailedRetryable,
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub scope: String,
    pub key_hash: String,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub response_body: Option<Value>,
    pub failure_reason: Option<String>,
    pub locked_until: DateTime<Utc>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Storage collaborator; implementations must make `create_processing` and
/// `try_reclaim` atomic.
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Insert a fresh processing record; `false` when the key already exists.
    async fn create_processing(&self, record: IdempotencyRecord) -> GatewayResult<bool>;
    async fn get_by_scope_and_key_hash(
        &self,
        scope: &str,
        key_hash: &str,
    ) -> GatewayResult<Option<IdempotencyRecord>>;
    /// Move an expired or retryable record back to processing under a new
    /// fingerprint and lock; `false` when someone else got there first.
    async fn try_reclaim(
        &self,
        scope: &str,
        key_hash: &str,
        fingerprint: &str,
        locked_until: DateTime<Utc>,
    ) -> GatewayResult<bool>;
    async fn extend_processing_lock(
        &self,
        scope: &str,
        key_hash: &str,
        locked_until: DateTime<Utc>,
    ) -> GatewayResult<bool>;
    async fn mark_succeeded(
        &self,
        scope: &str,
        key_hash: &str,
        response_body: Option<Value>,
        expires_at: DateTime<Utc>,
    ) -> GatewayResult<()>;
    async fn mark_failed_retryable(
        &self,
        scope: &str,
        key_hash: &str,
        reason: &str,
        backoff_until: DateTime<Utc>,
    ) -> GatewayResult<()>;
    /// Remove expired records, up to `batch`; returns rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>, batch: u32) -> GatewayResult<u64>;
}

// ============================================================================
// Key and fingerprint
// ============================================================================

fn hex_sha256(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Non-empty printable ASCII, at most 128 chars.
pub fn normalize_key(key: &str) -> GatewayResult<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_KEY_LENGTH {
        return Err(GatewayError::InvalidRequest(
            "idempotency key must be 1..=128 characters".into(),
        ));
    }
    if !trimmed.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(GatewayError::InvalidRequest(
            "idempotency key must be printable ASCII".into(),
        ));
    }
    Ok(trimmed.to_string())
}

/// JSON with object keys sorted recursively, so equal payloads fingerprint
/// equally regardless of field order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn fingerprint(method: &str, route: &str, actor_scope: &str, payload: &Value) -> String {
    hex_sha256(&[
        method.to_uppercase().as_bytes(),
        route.as_bytes(),
        actor_scope.as_bytes(),
        canonical_json(payload).as_bytes(),
    ])
}

fn key_hash(key: &str) -> String {
    hex_sha256(&[key.as_bytes()])
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct IdempotencyCoordinator {
    repo: Arc<dyn IdempotencyRepository>,
}

impl IdempotencyCoordinator {
    pub fn new(repo: Arc<dyn IdempotencyRepository>) -> Self {
        Self { repo }
    }

    fn cap_body(body: Value) -> Option<Value> {
        let max = config::load().idempotency.max_response_bytes;
        let serialized = body.to_string();
        if serialized.len() > max {
            crate::logger::warn(
                "idempotency",
                &format!(
                    "Response body {}B exceeds cap {}B; storing marker only",
                    serialized.len(),
                    max
                ),
            );
            return None;
        }
        Some(body)
    }

    async fn run_locked<F, Fut>(
        &self,
        scope: &str,
        key_hash: &str,
        ttl: Duration,
        executor: F,
    ) -> GatewayResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        // Renew the lease at roughly a third of its length so a slow
        // executor never loses the lock. Transient renewal errors are logged
        // and the loop keeps going.
        let renew_repo = self.repo.clone();
        let renew_scope = scope.to_string();
        let renew_key = key_hash.to_string();
        let renewer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROCESSING_LEASE / 3);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let until = Utc::now() + chrono::Duration::from_std(PROCESSING_LEASE).unwrap_or_default();
                match renew_repo
                    .extend_processing_lock(&renew_scope, &renew_key, until)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        crate::logger::warn(
                            "idempotency",
                            &format!("Lock renewal error (continuing): {}", e),
                        );
                    }
                }
            }
        });

        let outcome = executor().await;
        renewer.abort();

        match outcome {
            Ok(body) => {
                let stored = Self::cap_body(body.clone());
                self.repo
                    .mark_succeeded(
                        scope,
                        key_hash,
                        stored,
                        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    )
                    .await?;
                Ok(body)
            }
            Err(e) => {
                let backoff =
                    Utc::now() + chrono::Duration::from_std(FAILURE_BACKOFF).unwrap_or_default();
                let _ = self
                    .repo
                    .mark_failed_retryable(scope, key_hash, &e.to_string(), backoff)
                    .await;
                Err(e)
            }
        }
    }

    /// Execute `executor` at most once per `(scope, key, fingerprint)`.
    /// Returns `(data, replayed)`.
    pub async fn execute<F, Fut>(
        &self,
        scope: &str,
        actor_scope: &str,
        key: &str,
        method: &str,
        route: &str,
        payload: &Value,
        ttl: Duration,
        executor: F,
    ) -> GatewayResult<(Value, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        let key = normalize_key(key)?;
        let key_hash = key_hash(&key);
        let fingerprint = fingerprint(method, route, actor_scope, payload);
        let now = Utc::now();
        let locked_until =
            now + chrono::Duration::from_std(PROCESSING_LEASE).unwrap_or_default();

        let fresh = IdempotencyRecord {
            scope: scope.to_string(),
            key_hash: key_hash.clone(),
            fingerprint: fingerprint.clone(),
            status: IdempotencyStatus::Processing,
            response_body: None,
            failure_reason: None,
            locked_until,
            backoff_until: None,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        };

        if self.repo.create_processing(fresh).await? {
            let data = self.run_locked(scope, &key_hash, ttl, executor).await?;
            return Ok((data, false));
        }

        let record = self
            .repo
            .get_by_scope_and_key_hash(scope, &key_hash)
            .await?
            .ok_or_else(|| {
                GatewayError::IdempotencyUnavailable("record vanished during claim".into())
            })?;

        // Expired records are free for the taking, whatever their state.
        if record.expires_at <= now {
            if self
                .repo
                .try_reclaim(scope, &key_hash, &fingerprint, locked_until)
                .await?
            {
                let data = self.run_locked(scope, &key_hash, ttl, executor).await?;
                return Ok((data, false));
            }
            return Err(GatewayError::IdempotencyConflict { retry_after_secs: 1 });
        }

        if record.fingerprint != fingerprint {
            // Same key, different payload: never replay across changes.
            return Err(GatewayError::IdempotencyConflict { retry_after_secs: 0 });
        }

        match record.status {
            IdempotencyStatus::Succeeded => Ok((
                record.response_body.unwrap_or(Value::Null),
                true,
            )),
            IdempotencyStatus::Processing => {
                let retry_after = (record.locked_until - now).num_seconds().max(1) as u64;
                Err(GatewayError::IdempotencyConflict {
                    retry_after_secs: retry_after,
                })
            }
            IdempotencyStatus::FailedRetryable => {
                let backoff_live = record
                    .backoff_until
                    .map(|until| until > now)
                    .unwrap_or(false);
                if backoff_live {
                    let retry_after = record
                        .backoff_until
                        .map(|until| (until - now).num_seconds().max(1) as u64)
                        .unwrap_or(1);
                    return Err(GatewayError::IdempotencyConflict {
                        retry_after_secs: retry_after,
                    });
                }
                if self
                    .repo
                    .try_reclaim(scope, &key_hash, &fingerprint, locked_until)
                    .await?
                {
                    let data = self.run_locked(scope, &key_hash, ttl, executor).await?;
                    return Ok((data, false));
                }
                Err(GatewayError::IdempotencyConflict { retry_after_secs: 1 })
            }
        }
    }

    /// Cluster-wide single-flight over a named maintenance action. In
    /// `simple` run mode the lock is skipped entirely.
    pub async fn system_operation<F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        executor: F,
    ) -> GatewayResult<(Value, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<Value>>,
    {
        if config::load().run_mode_simple() {
            let data = executor().await?;
            return Ok((data, false));
        }
        self.execute(
            "system_operation",
            "system",
            name,
            "LOCK",
            name,
            &Value::Null,
            ttl,
            executor,
        )
        .await
    }

    /// Periodic expired-record sweep; call from a maintenance task.
    pub async fn cleanup(&self) -> GatewayResult<u64> {
        let cfg = config::load().idempotency;
        let removed = self
            .repo
            .delete_expired(Utc::now(), cfg.cleanup_batch_size)
            .await?;
        if removed > 0 {
            crate::logger::debug(
                "idempotency",
                &format!("Removed {} expired idempotency records", removed),
            );
        }
        Ok(removed)
    }
}

// ============================================================================
// In-memory repository
// ============================================================================

#[derive(Default)]
pub struct MemoryIdempotencyRepository {
    records: Mutex<HashMap<(String, String), IdempotencyRecord>>,
}

impl MemoryIdempotencyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryIdempotencyRepository {
    async fn create_processing(&self, record: IdempotencyRecord) -> GatewayResult<bool> {
        let mut records = self.records.lock().expect("record map poisoned");
        let key = (record.scope.clone(), record.key_hash.clone());
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record);
        Ok(true)
    }

    async fn get_by_scope_and_key_hash(
        &self,
        scope: &str,
        key_hash: &str,
    ) -> GatewayResult<Option<IdempotencyRecord>> {
        Ok(self
            .records
            .lock()
            .expect("record map poisoned")
            .get(&(scope.to_string(), key_hash.to_string()))
            .cloned())
    }

    async fn try_reclaim(
        &self,
        scope: &str,
        key_hash: &str,
        fingerprint: &str,
        locked_until: DateTime<Utc>,
    ) -> GatewayResult<bool> {
        let mut records = self.records.lock().expect("record map poisoned");
        let Some(record) = records.get_mut(&(scope.to_string(), key_hash.to_string())) else {
            return Ok(false);
        };
        let now = Utc::now();
        let reclaimable = record.expires_at <= now
            || (record.status == IdempotencyStatus::FailedRetryable
                && record.backoff_until.map(|b| b <= now).unwrap_or(true));
        if !reclaimable {
            return Ok(false);
        }
        record.status = IdempotencyStatus::Processing;
        record.fingerprint = fingerprint.to_string();
        record.locked_until = locked_until;
        record.backoff_until = None;
        record.response_body = None;
        record.failure_reason = None;
        record.expires_at = locked_until;
        Ok(true)
    }

    async fn extend_processing_lock(
        &self,
        scope: &str,
        key_hash: &str,
        locked_until: DateTime<Utc>,
    ) -> GatewayResult<bool> {
        let mut records = self.records.lock().expect("record map poisoned");
        match records.get_mut(&(scope.to_string(), key_hash.to_string())) {
            Some(record) if record.status == IdempotencyStatus::Processing => {
                record.locked_until = locked_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_succeeded(
        &self,
        scope: &str,
        key_hash: &str,
        response_body: Option<Value>,
        expires_at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let mut records = self.records.lock().expect("record map poisoned");
        if let Some(record) = records.get_mut(&(scope.to_string(), key_hash.to_string())) {
            record.status = IdempotencyStatus::Succeeded;
            record.response_body = response_body;
            record.expires_at = expires_at;
        }
        Ok(())
    }

    async fn mark_failed_retryable(
        &self,
        scope: &str,
        key_hash: &str,
        reason: &str,
        backoff_until: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let mut records = self.records.lock().expect("record map poisoned");
        if let Some(record) = records.get_mut(&(scope.to_string(), key_hash.to_string())) {
            record.status = IdempotencyStatus::FailedRetryable;
            record.failure_reason = Some(reason.to_string());
            record.backoff_until = Some(backoff_until);
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>, batch: u32) -> GatewayResult<u64> {
        let mut records = self.records.lock().expect("record map poisoned");
        let expired: Vec<_> = records
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(k, _)| k.clone())
            .take(batch as usize)
            .collect();
        let removed = expired.len() as u64;
        for key in expired {
            records.remove(&key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator() -> (IdempotencyCoordinator, Arc<MemoryIdempotencyRepository>) {
        let repo = Arc::new(MemoryIdempotencyRepository::new());
        (IdempotencyCoordinator::new(repo.clone()), repo)
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  abc-123  ").unwrap(), "abc-123");
        assert!(normalize_key("").is_err());
        assert!(normalize_key(&"x".repeat(129)).is_err());
        assert!(normalize_key("ключ").is_err());
    }

    #[test]
    fn test_canonical_json_is_order_insensitive() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            fingerprint("post", "/r", "tenant", &a),
            fingerprint("POST", "/r", "tenant", &b)
        );
        assert_ne!(
            fingerprint("POST", "/r", "tenant", &a),
            fingerprint("POST", "/r", "tenant", &json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn test_first_run_executes_second_replays() {
        let (coord, _repo) = coordinator();
        let payload = json!({"op": "create"});

        let (data, replayed) = coord
            .execute("admin", "t1", "key-1", "POST", "/accounts", &payload,
                Duration::from_secs(60), || async { Ok(json!({"id": 42})) })
            .await
            .unwrap();
        assert_eq!(data, json!({"id": 42}));
        assert!(!replayed);

        let (data, replayed) = coord
            .execute("admin", "t1", "key-1", "POST", "/accounts", &payload,
                Duration::from_secs(60), || async {
                    panic!("executor must not run twice");
                })
            .await
            .unwrap();
        assert_eq!(data, json!({"id": 42}));
        assert!(replayed);
    }

    #[tokio::test]
    async fn test_different_fingerprint_conflicts() {
        let (coord, _repo) = coordinator();
        coord
            .execute("admin", "t1", "key-1", "POST", "/accounts", &json!({"op": 1}),
                Duration::from_secs(60), || async { Ok(json!(1)) })
            .await
            .unwrap();

        let err = coord
            .execute("admin", "t1", "key-1", "POST", "/accounts", &json!({"op": 2}),
                Duration::from_secs(60), || async { Ok(json!(2)) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::IdempotencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_same_key_single_executor_run() {
        let (coord, _repo) = coordinator();
        let coord = Arc::new(coord);
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coord = coord.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                coord
                    .execute("admin", "t1", "key-x", "POST", "/op", &json!({"n": 1}),
                        Duration::from_secs(60), move || {
                            let runs = runs.clone();
                            async move {
                                runs.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(30)).await;
                                Ok(json!("done"))
                            }
                        })
                    .await
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok((data, _)) => {
                    assert_eq!(data, json!("done"));
                    successes += 1;
                }
                Err(GatewayError::IdempotencyConflict { retry_after_secs }) => {
                    assert!(retry_after_secs >= 1);
                    conflicts += 1;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(successes + conflicts, 8);
        assert!(successes >= 1);
    }

    #[tokio::test]
    async fn test_failed_retryable_backoff_then_reclaim() {
        let (coord, repo) = coordinator();
        let payload = json!({"op": 1});

        let err = coord
            .execute("admin", "t1", "key-f", "POST", "/op", &payload,
                Duration::from_secs(60), || async {
                    Err(GatewayError::Internal("boom".into()))
                })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));

        // Inside the backoff window: conflict.
        let err = coord
            .execute("admin", "t1", "key-f", "POST", "/op", &payload,
                Duration::from_secs(60), || async { Ok(json!(2)) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::IdempotencyConflict { .. }));

        // Expire the backoff by hand; the next caller reclaims and runs.
        {
            let key = super::key_hash("key-f");
            let mut records = repo.records.lock().unwrap();
            let record = records.get_mut(&("admin".to_string(), key)).unwrap();
            record.backoff_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        let (data, replayed) = coord
            .execute("admin", "t1", "key-f", "POST", "/op", &payload,
                Duration::from_secs(60), || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(data, json!(2));
        assert!(!replayed);
    }

    #[tokio::test]
    async fn test_expired_record_reclaimed() {
        let (coord, repo) = coordinator();
        let payload = json!({"op": 1});
        coord
            .execute("admin", "t1", "key-e", "POST", "/op", &payload,
                Duration::from_secs(60), || async { Ok(json!(1)) })
            .await
            .unwrap();
        {
            let key = super::key_hash("key-e");
            let mut records = repo.records.lock().unwrap();
            let record = records.get_mut(&("admin".to_string(), key)).unwrap();
            record.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let (data, replayed) = coord
            .execute("admin", "t1", "key-e", "POST", "/op", &payload,
                Duration::from_secs(60), || async { Ok(json!("fresh")) })
            .await
            .unwrap();
        assert_eq!(data, json!("fresh"));
        assert!(!replayed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired() {
        let (coord, repo) = coordinator();
        coord
            .execute("admin", "t1", "key-c", "POST", "/op", &json!(1),
                Duration::from_secs(60), || async { Ok(json!(1)) })
            .await
            .unwrap();
        {
            let key = super::key_hash("key-c");
            let mut records = repo.records.lock().unwrap();
            records
                .get_mut(&("admin".to_string(), key))
                .unwrap()
                .expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
        assert_eq!(coord.cleanup().await.unwrap(), 1);
        assert_eq!(coord.cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_system_operation_simple_mode_bypasses_lock() {
        let mut settings = crate::config::Settings::default();
        settings.run_mode = Some("simple".to_string());
        crate::config::replace(settings);

        let (coord, repo) = coordinator();
        let (data, replayed) = coord
            .system_operation("vacuum", Duration::from_secs(5), || async {
                Ok(json!("ran"))
            })
            .await
            .unwrap();
        assert_eq!(data, json!("ran"));
        assert!(!replayed);
        assert!(repo.records.lock().unwrap().is_empty());

        crate::config::replace(crate::config::Settings::default());
    }
}
