//! Sticky session registry
//!
//! Binds a conversation fingerprint to the account serving it so follow-up
//! turns land on the same upstream identity. Entries are keyed by group,
//! prompt-prefix hash, and a digest chain over message boundaries; lookup
//! walks the chain prefixes from longest to shortest so a continued
//! conversation matches its longest shared history.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickyEntry {
    pub session_uuid: Uuid,
    pub account_id: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, StickyEntry>,
    by_account: HashMap<u64, HashSet<String>>,
}

#[derive(Clone, Default)]
pub struct StickyRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// Fingerprint of the system prompt, used to partition chains.
pub fn prefix_hash(body: &serde_json::Value) -> String {
    let system = body
        .get("system")
        .map(|s| s.to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One digest per message boundary; prefixes of the chain identify shared
/// conversation history.
pub fn digest_chain(body: &serde_json::Value) -> Vec<String> {
    let Some(messages) = body.get("messages").and_then(|m| m.as_array()) else {
        return Vec::new();
    };
    let mut chain = Vec::with_capacity(messages.len());
    let mut hasher = Sha256::new();
    for message in messages {
        // Each digest covers the whole history up to and including the
        // message, so equal prefixes mean equal history.
        hasher.update(message.to_string().as_bytes());
        chain.push(format!("{:x}", hasher.clone().finalize()));
    }
    chain
}

fn entry_key(group_id: u64, prefix_hash: &str, chain_prefix: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(group_id.to_be_bytes());
    hasher.update(prefix_hash.as_bytes());
    for digest in chain_prefix {
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl StickyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Longest-prefix lookup over the digest chain.
    pub fn find(
        &self,
        group_id: u64,
        prefix_hash: &str,
        digest_chain: &[String],
    ) -> Option<StickyEntry> {
        let inner = self.inner.lock().ok()?;
        for end in (1..=digest_chain.len()).rev() {
            let key = entry_key(group_id, prefix_hash, &digest_chain[..end]);
            if let Some(entry) = inner.entries.get(&key) {
                return Some(entry.clone());
            }
        }
        // An empty chain still has the bare prefix key.
        if digest_chain.is_empty() {
            let key = entry_key(group_id, prefix_hash, &[]);
            return inner.entries.get(&key).cloned();
        }
        None
    }

    /// Record a binding; an existing entry for the same key is overwritten
    /// (writer wins).
    pub fn save(
        &self,
        group_id: u64,
        prefix_hash: &str,
        digest_chain: &[String],
        session_uuid: Uuid,
        account_id: u64,
    ) {
        let key = entry_key(group_id, prefix_hash, digest_chain);
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(previous) = inner.entries.insert(
            key.clone(),
            StickyEntry {
                session_uuid,
                account_id,
            },
        ) {
            if previous.account_id != account_id {
                if let Some(keys) = inner.by_account.get_mut(&previous.account_id) {
                    keys.remove(&key);
                }
            }
        }
        inner.by_account.entry(account_id).or_default().insert(key);
    }

    /// Drop every binding pointing at the account. `model` narrows the log
    /// line only; the binding itself is account-scoped.
    pub fn invalidate(&self, account_id: u64, model: Option<&str>) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let Some(keys) = inner.by_account.remove(&account_id) else {
            return 0;
        };
        let removed = keys.len();
        for key in keys {
            inner.entries.remove(&key);
        }
        if removed > 0 {
            crate::logger::info(
                "sticky",
                &format!(
                    "Invalidated {} sticky session(s) for account {}{}",
                    removed,
                    account_id,
                    model.map(|m| format!(" (model {})", m)).unwrap_or_default()
                ),
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_digest_chain_prefix_property() {
        let short = serde_json::json!({
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"}
            ]
        });
        let long = serde_json::json!({
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
                {"role": "user", "content": "c"}
            ]
        });
        let short_chain = digest_chain(&short);
        let long_chain = digest_chain(&long);
        assert_eq!(short_chain.len(), 2);
        assert_eq!(long_chain.len(), 3);
        // The grown conversation shares its prefix with the older one.
        assert_eq!(short_chain[..], long_chain[..2]);
        assert_eq!(prefix_hash(&short), prefix_hash(&long));

        let other_system = serde_json::json!({"system": "be verbose", "messages": []});
        assert_ne!(prefix_hash(&short), prefix_hash(&other_system));
    }

    #[test]
    fn test_save_and_find_exact() {
        let registry = StickyRegistry::new();
        let uuid = Uuid::new_v4();
        registry.save(1, "ph", &chain(&["d1", "d2"]), uuid, 7);

        let entry = registry.find(1, "ph", &chain(&["d1", "d2"])).unwrap();
        assert_eq!(entry.account_id, 7);
        assert_eq!(entry.session_uuid, uuid);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = StickyRegistry::new();
        let short = Uuid::new_v4();
        let long = Uuid::new_v4();
        registry.save(1, "ph", &chain(&["d1"]), short, 7);
        registry.save(1, "ph", &chain(&["d1", "d2"]), long, 8);

        // The conversation has grown past both entries; the longest stored
        // prefix is the two-element chain.
        let entry = registry
            .find(1, "ph", &chain(&["d1", "d2", "d3"]))
            .unwrap();
        assert_eq!(entry.account_id, 8);
        assert_eq!(entry.session_uuid, long);

        // A conversation that only shares the first message matches the
        // shorter entry.
        let entry = registry.find(1, "ph", &chain(&["d1"])).unwrap();
        assert_eq!(entry.account_id, 7);
    }

    #[test]
    fn test_groups_are_isolated() {
        let registry = StickyRegistry::new();
        registry.save(1, "ph", &chain(&["d1"]), Uuid::new_v4(), 7);
        assert!(registry.find(2, "ph", &chain(&["d1"])).is_none());
        assert!(registry.find(1, "other", &chain(&["d1"])).is_none());
    }

    #[test]
    fn test_invalidate_removes_account_bindings() {
        let registry = StickyRegistry::new();
        registry.save(1, "a", &chain(&["d1"]), Uuid::new_v4(), 7);
        registry.save(1, "b", &chain(&["d1"]), Uuid::new_v4(), 7);
        registry.save(1, "c", &chain(&["d1"]), Uuid::new_v4(), 8);

        assert_eq!(registry.invalidate(7, Some("claude-sonnet-4-5")), 2);
        assert!(registry.find(1, "a", &chain(&["d1"])).is_none());
        assert!(registry.find(1, "b", &chain(&["d1"])).is_none());
        assert!(registry.find(1, "c", &chain(&["d1"])).is_some());
        assert_eq!(registry.invalidate(7, None), 0);
    }

    #[test]
    fn test_writer_wins_on_same_key() {
        let registry = StickyRegistry::new();
        registry.save(1, "ph", &chain(&["d1"]), Uuid::new_v4(), 7);
        registry.save(1, "ph", &chain(&["d1"]), Uuid::new_v4(), 9);

        let entry = registry.find(1, "ph", &chain(&["d1"])).unwrap();
        assert_eq!(entry.account_id, 9);

        // The superseded account no longer owns the key.
        assert_eq!(registry.invalidate(7, None), 0);
        assert!(registry.find(1, "ph", &chain(&["d1"])).is_some());
    }
}
