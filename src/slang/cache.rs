//! In-memory LRU cache of enriched entries with TTL.
//! Key: blake3 hash of the lower-cased dictionary word, so a word that was
//! already enriched is not paid for twice within the TTL.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use super::SlangEntry;

struct CacheEntry {
    entry: SlangEntry,
    inserted_at: Instant,
}

pub struct EnrichmentCache {
    inner: Mutex<LruCache<[u8; 32], CacheEntry>>,
    ttl: Duration,
}

impl EnrichmentCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn compute_key(word: &str) -> [u8; 32] {
        let normalized = word.trim().to_lowercase();
        *blake3::hash(normalized.as_bytes()).as_bytes()
    }

    /// Returns None if absent or expired.
    pub fn get(&self, word: &str) -> Option<SlangEntry> {
        let key = Self::compute_key(word);
        let mut cache = self.inner.lock();
        if let Some(cached) = cache.get(&key) {
            if cached.inserted_at.elapsed() < self.ttl {
                return Some(cached.entry.clone());
            }
            cache.pop(&key);
        }
        None
    }

    pub fn insert(&self, word: &str, entry: SlangEntry) {
        let key = Self::compute_key(word);
        self.inner.lock().put(
            key,
            CacheEntry {
                entry,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slang::testing::entry;
    use crate::slang::RiskLevel;

    #[test]
    fn key_ignores_case_and_padding() {
        assert_eq!(
            EnrichmentCache::compute_key(" No Cap "),
            EnrichmentCache::compute_key("no cap")
        );
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = EnrichmentCache::new(4, Duration::ZERO);
        cache.insert("mid", entry("mid", RiskLevel::Safe));
        assert!(cache.get("mid").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_word_is_dropped() {
        let cache = EnrichmentCache::new(2, Duration::from_secs(60));
        cache.insert("a", entry("a", RiskLevel::Safe));
        cache.insert("b", entry("b", RiskLevel::Safe));
        assert!(cache.get("a").is_some());
        cache.insert("c", entry("c", RiskLevel::Safe));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").map(|e| e.phrase), Some("a".to_string()));
    }
}
