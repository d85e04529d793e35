use std::time::Duration;
use tracing::{info, warn};

use super::contextargs::MetaInput;
use crate::cache::TtlLruCache;
use crate::errors::TemplarError;

const CACHE_CAPACITY: usize = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Counts errors per `host:port` and tells callers to skip hosts that went
/// over the threshold.
pub struct HostErrorsCache {
    max_host_error: u32,
    track_errors: Vec<String>,
    failed: TtlLruCache<String, u32>,
}

impl HostErrorsCache {
    pub fn new(max_host_error: u32, track_errors: Vec<String>) -> Self {
        Self::with_capacity(max_host_error, track_errors, CACHE_CAPACITY, CACHE_TTL)
    }

    pub fn with_capacity(max_host_error: u32, track_errors: Vec<String>, capacity: usize, ttl: Duration) -> Self {
        Self { max_host_error, track_errors, failed: TtlLruCache::new(capacity, ttl) }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_host_error > 0
    }

    /// Whether requests to this host should be skipped.
    pub fn check(&self, input: &MetaInput) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.failed
            .get(&input.host_key())
            .map(|count| count >= self.max_host_error)
            .unwrap_or(false)
    }

    /// Record `error` against the host when it is a host-level failure.
    /// Returns whether it was counted.
    pub fn mark_failed(&self, input: &MetaInput, error: &TemplarError) -> bool {
        if !self.is_enabled() || !self.counts(error) {
            return false;
        }
        let key = input.host_key();
        let count = self.failed.upsert(key.clone(), 0, |n| *n = n.saturating_add(1));
        if count == self.max_host_error {
            warn!(host = %key, errors = count, "Host reached the error threshold, skipping further requests");
        } else {
            info!(host = %key, errors = count, "Recorded host error");
        }
        true
    }

    fn counts(&self, error: &TemplarError) -> bool {
        if error.classify().host_error {
            return true;
        }
        let message = error.to_string();
        self.track_errors.iter().any(|needle| message.contains(needle.as_str()))
    }

    pub fn error_count(&self, input: &MetaInput) -> u32 {
        self.failed.get(&input.host_key()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> TemplarError {
        TemplarError::Network("connection refused".into())
    }

    #[test]
    fn test_threshold_skips_only_failing_host() {
        let cache = HostErrorsCache::new(3, Vec::new());
        let bad = MetaInput::new("http://10.0.0.1:8080");
        let good = MetaInput::new("http://10.0.0.2:8080");
        for _ in 0..2 {
            assert!(cache.mark_failed(&bad, &refused()));
        }
        assert!(!cache.check(&bad));
        cache.mark_failed(&bad, &refused());
        assert!(cache.check(&bad));
        assert!(!cache.check(&good));
    }

    #[test]
    fn test_same_host_different_paths_share_counter() {
        let cache = HostErrorsCache::new(2, Vec::new());
        cache.mark_failed(&MetaInput::new("http://a.com/x"), &refused());
        cache.mark_failed(&MetaInput::new("http://a.com/y"), &refused());
        assert!(cache.check(&MetaInput::new("a.com")));
    }

    #[test]
    fn test_non_host_errors_not_counted() {
        let cache = HostErrorsCache::new(1, Vec::new());
        let input = MetaInput::new("a.com");
        assert!(!cache.mark_failed(&input, &TemplarError::Expression("bad".into())));
        assert!(!cache.check(&input));
    }

    #[test]
    fn test_tracked_substrings_counted() {
        let cache = HostErrorsCache::new(1, vec!["tls handshake".into()]);
        let input = MetaInput::new("a.com");
        assert!(cache.mark_failed(&input, &TemplarError::Protocol("tls handshake failed".into())));
        assert!(cache.check(&input));
    }

    #[test]
    fn test_disabled() {
        let cache = HostErrorsCache::new(0, Vec::new());
        let input = MetaInput::new("a.com");
        assert!(!cache.mark_failed(&input, &refused()));
        assert!(!cache.check(&input));
    }
}
