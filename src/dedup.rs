//! Operation dedup cache.
//!
//! Clients retry calls that may already have been applied. Each mutating call
//! carries an [`OperationId`]; once the call commits, the id is recorded here
//! and a retried call with the same id returns the current state instead of
//! mutating again.

use crate::types::OperationId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Dedup cache statistics.
#[derive(Debug, Clone, Default)]
pub struct OperationCacheStats {
    /// Lookups that found an applied operation.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Recorded operations currently held.
    pub entries: usize,
}

/// Bounded ledger of applied operation ids.
pub struct OperationCache {
    entries: Mutex<LruCache<OperationId, Instant>>,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl OperationCache {
    /// Create a cache holding at most `capacity` ids for at most `max_age`.
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether the operation was already applied.
    pub fn contains(&self, id: &OperationId) -> bool {
        let mut entries = self.entries.lock();
        let applied = match entries.get(id) {
            Some(recorded) if recorded.elapsed() <= self.max_age => true,
            Some(_) => {
                entries.pop(id);
                false
            }
            None => false,
        };
        if applied {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        applied
    }

    /// Mark the operation as applied.
    pub fn record(&self, id: OperationId) {
        self.entries.lock().put(id, Instant::now());
    }

    pub fn stats(&self) -> OperationCacheStats {
        OperationCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}
