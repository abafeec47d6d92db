//! Negative caching for daemon reachability.
//!
//! A failed probe is remembered for a bounded interval so a burst of
//! launches against a dead endpoint does not hammer it with connection
//! attempts.  Successes clear the memory immediately.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub(crate) struct NegativeCache {
    ttl: Duration,
    last_failure: Mutex<Option<Instant>>,
}

impl NegativeCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_failure: Mutex::new(None),
        }
    }

    /// Whether the endpoint is still assumed dead.
    pub(crate) fn blocked(&self) -> bool {
        let guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub(crate) fn record_failure(&self) {
        let mut guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now());
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_blocks_nothing() {
        assert!(!NegativeCache::new(Duration::from_secs(1)).blocked());
    }

    #[test]
    fn failure_blocks_until_ttl_expires() {
        let cache = NegativeCache::new(Duration::from_millis(40));
        cache.record_failure();
        assert!(cache.blocked());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!cache.blocked());
    }

    #[test]
    fn success_clears_immediately() {
        let cache = NegativeCache::new(Duration::from_secs(60));
        cache.record_failure();
        cache.clear();
        assert!(!cache.blocked());
    }
}
