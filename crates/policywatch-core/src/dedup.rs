//! Time-windowed, size-bounded cache of already seen correlation IDs
//!
//! The cache is a best-effort suppressor: absence of a key means "not seen
//! yet or expired". Entries expire after the TTL; when the byte bound is
//! reached the oldest entries are evicted first.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Default aggregate size bound (256MB)
pub const DEFAULT_MAX_BYTES: usize = 256 * 1024 * 1024;

// Approximate bookkeeping cost of one entry on top of the key bytes
const ENTRY_OVERHEAD: usize = 64;

/// Shared dedup cache; clones share the same storage
#[derive(Clone)]
pub struct DedupCache {
    inner: Arc<Mutex<CacheInner>>,
    ttl: Duration,
    max_bytes: usize,
}

struct CacheInner {
    entries: HashMap<String, Instant>,
    // Insertion order; with a fixed TTL this is also expiry order
    order: VecDeque<(String, Instant)>,
    bytes: usize,
}

impl DedupCache {
    /// Create a cache with the given TTL and byte bound
    pub fn new(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            })),
            ttl,
            max_bytes,
        }
    }

    /// Record `key` as seen. Returns `true` if it was not already present,
    /// i.e. the caller should process the record.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Instant::now())
    }

    /// Whether `key` is present and unexpired
    pub fn contains(&self, key: &str) -> bool {
        self.contains_at(key, Instant::now())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.evict_expired(Instant::now(), self.ttl);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn check_and_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.evict_expired(now, self.ttl);

        if inner.entries.contains_key(key) {
            return false;
        }

        let cost = key.len() + ENTRY_OVERHEAD;
        while inner.bytes + cost > self.max_bytes && inner.evict_oldest() {}

        inner.entries.insert(key.to_string(), now);
        inner.order.push_back((key.to_string(), now));
        inner.bytes += cost;
        true
    }

    fn contains_at(&self, key: &str, now: Instant) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|inserted| now.duration_since(*inserted) < self.ttl)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_BYTES)
    }
}

impl CacheInner {
    fn evict_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < ttl {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((key, inserted)) = self.order.pop_front() else {
            return false;
        };
        // Only drop the map entry if it still belongs to this insertion
        if self.entries.get(&key) == Some(&inserted) {
            self.entries.remove(&key);
        }
        self.bytes = self.bytes.saturating_sub(key.len() + ENTRY_OVERHEAD);
        true
    }
}
