//! Block layer interface.
//!
//! The namespace master never stores block data. It allocates block
//! containers, reads committed block lengths when completing a file, and asks
//! the block layer to drop blocks when files are deleted or freed.

use crate::error::{CanopyError, Result};
use crate::types::{BlockId, ContainerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Committed block metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub length: u64,
}

/// The block layer as seen by the namespace master.
#[async_trait]
pub trait BlockMaster: Send + Sync {
    /// Allocate a fresh block container id.
    fn new_container_id(&self) -> ContainerId;

    /// Committed block infos for the given ids, skipping uncommitted ones.
    async fn block_infos(&self, ids: &[BlockId]) -> Result<Vec<BlockInfo>>;

    /// Drop blocks. With `delete` the block metadata is removed as well;
    /// otherwise only the cached copies are released.
    async fn remove_blocks(&self, ids: &[BlockId], delete: bool) -> Result<()>;
}

/// In-memory block layer.
#[derive(Debug, Default)]
pub struct InMemoryBlockMaster {
    next_container: AtomicU64,
    committed: Mutex<HashMap<BlockId, u64>>,
    cached: Mutex<HashSet<BlockId>>,
    deleted: Mutex<Vec<BlockId>>,
    freed: Mutex<Vec<BlockId>>,
    failures_remaining: AtomicU32,
    remove_calls: AtomicU32,
}

impl InMemoryBlockMaster {
    pub fn new() -> Self {
        Self {
            next_container: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Record a committed block of the given length.
    pub fn commit_block(&self, id: BlockId, length: u64) {
        self.committed.lock().insert(id, length);
        self.cached.lock().insert(id);
    }

    /// Whether a cached copy of the block exists.
    pub fn is_cached(&self, id: BlockId) -> bool {
        self.cached.lock().contains(&id)
    }

    /// Blocks removed with `delete = true`.
    pub fn deleted_blocks(&self) -> Vec<BlockId> {
        self.deleted.lock().clone()
    }

    /// Blocks freed with `delete = false`.
    pub fn freed_blocks(&self) -> Vec<BlockId> {
        self.freed.lock().clone()
    }

    /// Make the next `count` removal calls fail.
    pub fn fail_next_removals(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of removal calls, failed ones included.
    pub fn remove_calls(&self) -> u32 {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockMaster for InMemoryBlockMaster {
    fn new_container_id(&self) -> ContainerId {
        self.next_container.fetch_add(1, Ordering::SeqCst)
    }

    async fn block_infos(&self, ids: &[BlockId]) -> Result<Vec<BlockInfo>> {
        let committed = self.committed.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                committed.get(id).map(|length| BlockInfo {
                    block_id: *id,
                    length: *length,
                })
            })
            .collect())
    }

    async fn remove_blocks(&self, ids: &[BlockId], delete: bool) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CanopyError::Unavailable("block layer unreachable".to_string()));
        }

        let mut cached = self.cached.lock();
        for id in ids {
            cached.remove(id);
        }
        if delete {
            let mut committed = self.committed.lock();
            for id in ids {
                committed.remove(id);
            }
            self.deleted.lock().extend_from_slice(ids);
        } else {
            self.freed.lock().extend_from_slice(ids);
        }
        Ok(())
    }
}
