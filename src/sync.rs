//! Metadata sync hooks.
//!
//! Reconciling the namespace with under storage is delegated to a
//! [`MetadataSyncer`]. The master calls it before taking locks and treats a
//! failed sync as "proceed without sync". Paths registered as active sync
//! points are tracked by the [`ActiveSyncManager`] so that deleting or
//! unmounting them can stop syncing first.

use crate::error::{CanopyError, Result};
use crate::journal::{JournalContext, JournalEntry};
use crate::path::NamespacePath;
use crate::types::{DescendantType, MountId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::info;

/// Outcome of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ok,
    NotNeeded,
    Failed,
}

/// Options shared by every operation that may sync first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Minimum age of the last sync before syncing again. `-1` never syncs,
    /// `0` always syncs.
    pub sync_interval_ms: i64,
}

impl SyncOptions {
    pub const NEVER: SyncOptions = SyncOptions { sync_interval_ms: -1 };

    pub fn always() -> Self {
        Self { sync_interval_ms: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.sync_interval_ms >= 0
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::NEVER
    }
}

/// Reconciles a namespace path with its under storage.
#[async_trait]
pub trait MetadataSyncer: Send + Sync {
    async fn sync(&self, path: &NamespacePath, descendants: DescendantType, options: &SyncOptions) -> SyncStatus;
}

/// Syncer that never has anything to do.
#[derive(Debug, Default)]
pub struct NoopSyncer;

#[async_trait]
impl MetadataSyncer for NoopSyncer {
    async fn sync(&self, _path: &NamespacePath, _descendants: DescendantType, _options: &SyncOptions) -> SyncStatus {
        SyncStatus::NotNeeded
    }
}

/// Registry of active sync points.
#[derive(Default)]
pub struct ActiveSyncManager {
    points: RwLock<BTreeMap<NamespacePath, MountId>>,
}

impl ActiveSyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sync_point(&self, path: &NamespacePath) -> bool {
        self.points.read().contains_key(path)
    }

    /// Sync points at or below `path`.
    pub fn sync_points_under(&self, path: &NamespacePath) -> Vec<NamespacePath> {
        self.points
            .read()
            .keys()
            .filter(|p| path.is_prefix_of(p))
            .cloned()
            .collect()
    }

    pub fn sync_points(&self) -> Vec<(NamespacePath, MountId)> {
        self.points.read().iter().map(|(p, m)| (p.clone(), *m)).collect()
    }

    /// Start syncing `path`. Nested sync points are rejected.
    pub fn start_sync(&self, ctx: &mut JournalContext, path: &NamespacePath, mount_id: MountId) -> Result<()> {
        {
            let points = self.points.read();
            if let Some(existing) = points
                .keys()
                .find(|p| p.is_prefix_of(path) || path.is_prefix_of(p))
            {
                return Err(CanopyError::InvalidPath(format!(
                    "{} overlaps the active sync point {}",
                    path, existing
                )));
            }
        }
        self.apply_and_journal(
            ctx,
            JournalEntry::AddSyncPoint {
                path: path.to_string(),
                mount_id,
            },
        )?;
        info!(path = %path, mount_id, "Started active sync");
        Ok(())
    }

    /// Stop syncing `path`.
    pub fn stop_sync(&self, ctx: &mut JournalContext, path: &NamespacePath) -> Result<()> {
        if !self.is_sync_point(path) {
            return Err(CanopyError::InvalidPath(format!("{} is not a sync point", path)));
        }
        self.apply_and_journal(ctx, JournalEntry::RemoveSyncPoint { path: path.to_string() })?;
        info!(path = %path, "Stopped active sync");
        Ok(())
    }

    /// Stop every sync point of a mount. Returns the stopped paths.
    pub fn stop_sync_for_mount(&self, ctx: &mut JournalContext, mount_id: MountId) -> Result<Vec<NamespacePath>> {
        let stopped: Vec<NamespacePath> = self
            .points
            .read()
            .iter()
            .filter(|(_, m)| **m == mount_id)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &stopped {
            self.stop_sync(ctx, path)?;
        }
        Ok(stopped)
    }

    fn apply_and_journal(&self, ctx: &mut JournalContext, entry: JournalEntry) -> Result<()> {
        self.apply(&entry)?;
        ctx.append(entry);
        Ok(())
    }

    /// Apply a sync point entry; other entries are ignored.
    pub fn apply(&self, entry: &JournalEntry) -> Result<()> {
        match entry {
            JournalEntry::AddSyncPoint { path, mount_id } => {
                self.points.write().insert(NamespacePath::new(path)?, *mount_id);
            }
            JournalEntry::RemoveSyncPoint { path } => {
                self.points.write().remove(&NamespacePath::new(path)?);
            }
            _ => {}
        }
        Ok(())
    }
}
