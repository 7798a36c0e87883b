//! Base-URL availability
//!
//! Providers expose several equivalent base URLs. This table remembers which
//! one succeeded last and which ones are temporarily sidelined after a
//! connection error or 429, so attempts try the healthiest URL first.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct UrlState {
    url: String,
    unavailable_until: Option<Instant>,
}

/// Ordered URL list with temporary sidelining. Reads take a snapshot;
/// writes are serialized behind the lock.
#[derive(Clone)]
pub struct UrlAvailability {
    inner: Arc<Mutex<Vec<UrlState>>>,
    unavailable_timeout: Duration,
}

impl UrlAvailability {
    pub fn new(urls: Vec<String>, unavailable_timeout: Duration) -> Self {
        let states = urls
            .into_iter()
            .map(|url| UrlState {
                url,
                unavailable_until: None,
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(states)),
            unavailable_timeout,
        }
    }

    pub fn from_config(urls: Vec<String>) -> Self {
        let secs = crate::config::load().retry.url_unavailable_seconds;
        Self::new(urls, Duration::from_secs(secs))
    }

    /// URLs in try order: available ones first, in stored order (head is the
    /// most recent success). When every URL is sidelined, all are returned so
    /// the caller can still make progress.
    pub fn ordered(&self) -> Vec<String> {
        let now = Instant::now();
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let available: Vec<String> = guard
            .iter()
            .filter(|s| s.unavailable_until.map(|t| now >= t).unwrap_or(true))
            .map(|s| s.url.clone())
            .collect();
        if available.is_empty() {
            guard.iter().map(|s| s.url.clone()).collect()
        } else {
            available
        }
    }

    /// Promote the URL to the head of the list and clear its sideline.
    pub fn mark_success(&self, url: &str) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if let Some(pos) = guard.iter().position(|s| s.url == url) {
            let mut state = guard.remove(pos);
            state.unavailable_until = None;
            guard.insert(0, state);
        }
    }

    /// Sideline the URL for the configured timeout.
    pub fn mark_unavailable(&self, url: &str) {
        let until = Instant::now() + self.unavailable_timeout;
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if let Some(state) = guard.iter_mut().find(|s| s.url == url) {
            state.unavailable_until = Some(until);
            crate::logger::warn(
                "upstream",
                &format!(
                    "Base URL marked unavailable for {:?}: {}",
                    self.unavailable_timeout, url
                ),
            );
        }
    }

    pub fn is_available(&self, url: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .find(|s| s.url == url)
                    .map(|s| s.unavailable_until.map(|t| now >= t).unwrap_or(true))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(urls: &[&str]) -> UrlAvailability {
        UrlAvailability::new(
            urls.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_ordered_preserves_initial_order() {
        let t = table(&["a", "b", "c"]);
        assert_eq!(t.ordered(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unavailable_urls_skipped() {
        let t = table(&["a", "b"]);
        t.mark_unavailable("a");
        assert_eq!(t.ordered(), vec!["b"]);
        assert!(!t.is_available("a"));
        assert!(t.is_available("b"));
    }

    #[test]
    fn test_success_promotes_to_head() {
        let t = table(&["a", "b", "c"]);
        t.mark_success("c");
        assert_eq!(t.ordered(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_success_clears_sideline() {
        let t = table(&["a", "b"]);
        t.mark_unavailable("b");
        t.mark_success("b");
        assert_eq!(t.ordered(), vec!["b", "a"]);
    }

    #[test]
    fn test_all_unavailable_returns_all() {
        let t = table(&["a", "b"]);
        t.mark_unavailable("a");
        t.mark_unavailable("b");
        assert_eq!(t.ordered(), vec!["a", "b"]);
    }

    #[test]
    fn test_expired_sideline_recovers() {
        let t = UrlAvailability::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::from_millis(0),
        );
        t.mark_unavailable("a");
        assert_eq!(t.ordered(), vec!["a", "b"]);
    }
}
