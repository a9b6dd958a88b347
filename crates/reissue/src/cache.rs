//! Replacement cache for reissue requests
//!
//! Several transfer routines inside one tool often hit the quota at the same
//! moment and all report the same dead credential. The first report gets a
//! fresh replacement; the rest converge on that answer for a short window.
//!
//! Each answer is stored under the stale credential and mirrored under the
//! replacement, sharing one hit counter, so a routine that already switched
//! and reports the replacement inside the window gets it back too.
//!
//! Per stale key:
//! - Unseen → caller bans, leases, and `insert`s
//! - Cached, fresh, hits ≤ max → replacement returned, hits + 1
//! - Cached, fresh, hits > max → evicted, treated as Unseen
//! - Cached, expired → evicted, treated as Unseen

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Default lifetime of a cached replacement.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Default number of repeat answers before a fresh replacement is issued.
pub const DEFAULT_MAX_HITS: u32 = 4;

#[derive(Debug)]
struct Entry {
    replacement: String,
    expires_at: Instant,
    hits: AtomicU32,
}

/// Stale credential → replacement answers for one server.
#[derive(Debug)]
pub struct ReissueCache {
    entries: HashMap<String, Arc<Entry>>,
    ttl: Duration,
    max_hits: u32,
}

impl ReissueCache {
    pub fn new(ttl: Duration, max_hits: u32) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_hits,
        }
    }

    /// Cached replacement for `old`, if it is still fresh and under the cap.
    ///
    /// Counts the hit. An expired or over-used entry is evicted and `None`
    /// returned so the caller issues a new replacement.
    pub fn lookup(&mut self, old: &str, now: Instant) -> Option<String> {
        let entry = self.entries.get(old)?;

        if entry.expires_at <= now {
            trace!(old, "cached replacement expired");
            self.entries.remove(old);
            return None;
        }

        let hits = entry.hits.fetch_add(1, Ordering::Relaxed) + 1;
        if hits <= self.max_hits {
            debug!(old, replacement = %entry.replacement, hits, "reissuing cached replacement");
            return Some(entry.replacement.clone());
        }

        debug!(old, hits, max_hits = self.max_hits, "cached replacement over hit cap");
        self.entries.remove(old);
        None
    }

    /// Record `replacement` as the answer for `old`, mirrored under
    /// `replacement` itself. Expired entries are dropped on the way.
    pub fn insert(&mut self, old: &str, replacement: &str, now: Instant) {
        self.entries.retain(|_, e| e.expires_at > now);

        let entry = Arc::new(Entry {
            replacement: replacement.to_string(),
            expires_at: now + self.ttl,
            hits: AtomicU32::new(0),
        });
        self.entries.insert(old.to_string(), entry.clone());
        self.entries.insert(replacement.to_string(), entry);
    }

    /// Number of cached keys (stale and mirrored).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ReissueCache {
        ReissueCache::new(DEFAULT_CACHE_TTL, DEFAULT_MAX_HITS)
    }

    #[test]
    fn unseen_key_misses() {
        let mut cache = cache();
        assert!(cache.lookup("/sa/sa1.json", Instant::now()).is_none());
    }

    #[test]
    fn fresh_entry_answers_up_to_max_hits() {
        let mut cache = cache();
        let now = Instant::now();
        cache.insert("/sa/sa1.json", "/sa/sa2.json", now);

        for _ in 0..DEFAULT_MAX_HITS {
            assert_eq!(
                cache.lookup("/sa/sa1.json", now).as_deref(),
                Some("/sa/sa2.json")
            );
        }
        assert!(cache.lookup("/sa/sa1.json", now).is_none());
        // Evicted: stays a miss until a new insert
        assert!(cache.lookup("/sa/sa1.json", now).is_none());
    }

    #[test]
    fn replacement_is_mirrored_and_shares_hits() {
        let mut cache = cache();
        let now = Instant::now();
        cache.insert("/sa/sa1.json", "/sa/sa2.json", now);
        assert_eq!(cache.len(), 2);

        assert_eq!(
            cache.lookup("/sa/sa2.json", now).as_deref(),
            Some("/sa/sa2.json")
        );
        for _ in 1..DEFAULT_MAX_HITS {
            assert!(cache.lookup("/sa/sa1.json", now).is_some());
        }
        // Fifth hit on the shared counter is over the cap
        assert!(cache.lookup("/sa/sa1.json", now).is_none());
    }

    #[test]
    fn expired_entry_is_evicted() {
        let mut cache = ReissueCache::new(Duration::from_secs(10), 4);
        let then = Instant::now();
        cache.insert("/sa/sa1.json", "/sa/sa2.json", then);

        let later = then + Duration::from_secs(11);
        assert!(cache.lookup("/sa/sa1.json", later).is_none());
        assert_eq!(cache.len(), 1, "only the stale key is evicted on lookup");
    }

    #[test]
    fn insert_drops_expired_entries() {
        let mut cache = ReissueCache::new(Duration::from_secs(10), 4);
        let then = Instant::now();
        cache.insert("/sa/sa1.json", "/sa/sa2.json", then);

        cache.insert("/sa/sa3.json", "/sa/sa4.json", then + Duration::from_secs(20));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("/sa/sa1.json", then).is_none());
    }

    #[test]
    fn zero_max_hits_never_reuses() {
        let mut cache = ReissueCache::new(DEFAULT_CACHE_TTL, 0);
        let now = Instant::now();
        cache.insert("/sa/sa1.json", "/sa/sa2.json", now);
        assert!(cache.lookup("/sa/sa1.json", now).is_none());
    }
}
