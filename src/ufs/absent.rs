//! Cache of UFS paths known to be absent.
//!
//! Metadata sync consults the cache to skip UFS lookups for paths that were
//! recently found missing. The namespace master tells the cache whenever a
//! path starts to exist in under storage (a new persisted file or directory,
//! a completed persist job), which also revives every ancestor.

use crate::path::ufs_parent;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Bounded set of absent UFS paths.
pub struct AbsentPathCache {
    paths: Mutex<LruCache<String, ()>>,
}

impl AbsentPathCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            paths: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Remember that `path` does not exist.
    pub fn add_absent(&self, path: &str) {
        self.paths.lock().put(path.to_string(), ());
    }

    /// Whether `path` or one of its ancestors is known to be absent.
    pub fn is_absent(&self, path: &str) -> bool {
        let mut paths = self.paths.lock();
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            if paths.get(&p).is_some() {
                return true;
            }
            current = ufs_parent(&p);
        }
        false
    }

    /// `path` exists now; forget it and every ancestor.
    pub fn process_existing(&self, path: &str) {
        let mut paths = self.paths.lock();
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            paths.pop(&p);
            current = ufs_parent(&p);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}
