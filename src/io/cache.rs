//! Last-check cache
//!
//! TTL-bounded map of tracking code -> last successful carrier check. Only an
//! auxiliary rate-limit hint: losing it never affects correctness.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct LastCheckCache {
    ttl: Duration,
    entries: Mutex<FxHashMap<String, Instant>>,
}

impl LastCheckCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(FxHashMap::default()) }
    }

    pub fn record(&self, code: &str) {
        self.entries.lock().insert(code.to_string(), Instant::now());
    }

    /// Time since the last recorded check, if it has not expired
    pub fn age(&self, code: &str) -> Option<Duration> {
        let mut entries = self.entries.lock();
        let age = entries.get(code)?.elapsed();
        if age >= self.ttl {
            entries.remove(code);
            return None;
        }
        Some(age)
    }

    pub fn is_fresh(&self, code: &str) -> bool {
        self.age(code).is_some()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, at| at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = LastCheckCache::new(Duration::from_secs(300));
        cache.record("AB12345678901CD");
        assert!(cache.is_fresh("AB12345678901CD"));
        assert!(!cache.is_fresh("ZZ12345678901ZZ"));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(cache.age("AB12345678901CD"), Some(Duration::from_secs(120)));

        tokio::time::advance(Duration::from_secs(180)).await;
        assert!(!cache.is_fresh("AB12345678901CD"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = LastCheckCache::new(Duration::from_secs(60));
        cache.record("AA00000000001AA");
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.record("AA00000000002AA");

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
