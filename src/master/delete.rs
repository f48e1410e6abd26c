//! Recursive delete with partial success.

use super::{CallContext, DeleteOptions, DeleteResult, FileSystemMaster};
use crate::error::{CanopyError, Result};
use crate::journal::TransactionContext;
use crate::lock::{LockPattern, PathLockGuard};
use crate::metadata::Inode;
use crate::path::NamespacePath;
use crate::types::{now_ms, DescendantType, InodeId, ModeBits};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

impl FileSystemMaster {
    /// Delete a file or directory.
    ///
    /// Nodes the caller may not remove are skipped together with their
    /// ancestors; the rest of the subtree is still removed. Under storage
    /// failures are aggregated into one error unless
    /// [`DeleteOptions::skip_not_persisted`] is set, in which case they are
    /// only reported in the result.
    pub async fn delete(&self, ctx: &CallContext, path: &NamespacePath, options: DeleteOptions) -> Result<DeleteResult> {
        if self.is_applied(ctx) {
            return Ok(DeleteResult::default());
        }
        let descendants = if options.recursive {
            DescendantType::All
        } else {
            DescendantType::One
        };
        self.sync_path(ctx, path, descendants).await;
        let options = &options;
        self.retry("delete", path, move || async move {
            let mut tx = self.transaction();
            let result = self.delete_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn delete_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        if path.is_root() {
            return Err(CanopyError::InvalidPath("Cannot delete the root directory".to_string()));
        }
        let mut guard = self.locks.lock_path(path, LockPattern::WriteEdge).await?;
        let target = guard.target()?;
        if !options.unchecked {
            self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;
        }
        if !options.alluxio_only {
            self.mounts.check_under_writable_mount(path)?;
        }
        if target.is_directory() && target.child_count() > 0 && !options.recursive {
            return Err(CanopyError::DirectoryNotEmpty(format!(
                "{} is not empty and recursive is not set",
                path
            )));
        }

        let mounts = self.mounts.mounts_under(path);
        if !mounts.is_empty() && !options.delete_mount_point {
            let paths: Vec<&str> = mounts.iter().map(|m| m.path.as_str()).collect();
            return Err(CanopyError::AccessDenied(format!(
                "Cannot delete path {} which is or contains a mount point without --deleteMountPoint/-m option specified (mount points: {})",
                path,
                paths.join(", ")
            )));
        }
        if !options.alluxio_only {
            let read_only: Vec<&str> = mounts
                .iter()
                .filter(|m| m.options.read_only)
                .map(|m| m.path.as_str())
                .collect();
            if !read_only.is_empty() {
                return Err(CanopyError::AccessDenied(format!(
                    "Cannot delete directory {}. Failed to delete children: {} (read-only mount)",
                    path,
                    read_only.join(", ")
                )));
            }
        }

        let result = self.delete_locked(ctx, tx, &mut guard, options).await?;
        match result.failure_error() {
            Some(e) if !options.skip_not_persisted => Err(e),
            _ => {
                self.record_applied(ctx);
                Ok(result)
            }
        }
    }

    /// Delete the guarded target and its subtree. The caller holds a
    /// write-edge lock on the target and has validated the request.
    pub(crate) async fn delete_locked(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        guard: &mut PathLockGuard,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        let path = guard.path().clone();
        let target = guard.target()?;
        let mut nodes: Vec<(NamespacePath, Inode)> = vec![(path.clone(), target.clone())];
        if target.is_directory() {
            nodes.extend(
                guard
                    .lock_descendants()
                    .await?
                    .into_iter()
                    .map(|d| (d.path, d.inode)),
            );
        }

        for sync_point in self.sync_manager.sync_points_under(&path) {
            self.sync_manager.stop_sync(tx.journal(), &sync_point)?;
        }

        let parents: HashMap<InodeId, InodeId> = nodes.iter().map(|(_, inode)| (inode.id, inode.parent_id)).collect();
        let mut result = DeleteResult::default();
        let mut denied: HashSet<InodeId> = HashSet::new();
        let mut unsafe_ids: HashSet<InodeId> = HashSet::new();
        for (node_path, inode) in nodes.iter().skip(1) {
            let is_denied = if denied.contains(&inode.parent_id) {
                true
            } else if !options.unchecked
                && self
                    .permissions
                    .check_inode(&ctx.user, inode, ModeBits::WRITE, node_path.as_str())
                    .is_err()
            {
                debug!(path = %node_path, "Skipping delete of a protected path");
                true
            } else if let Err(e) = self.check_writable(node_path, options) {
                result.failures.push((node_path.to_string(), e.to_string()));
                true
            } else {
                false
            };
            if is_denied {
                denied.insert(inode.id);
                mark_unsafe(&parents, &mut unsafe_ids, inode.id);
            }
        }

        let now = now_ms();
        for (node_path, inode) in nodes.iter().rev() {
            ctx.cancel.check(node_path)?;
            if unsafe_ids.contains(&inode.id) {
                result.skipped.push(node_path.to_string());
                continue;
            }

            if let Some(mount) = self.mounts.mount_info(node_path) {
                self.sync_manager.stop_sync_for_mount(tx.journal(), mount.mount_id)?;
                self.mounts.delete(tx.journal(), node_path)?;
            } else if inode.is_persisted() && !options.alluxio_only {
                if let Err(e) = self.delete_from_ufs(inode, node_path).await {
                    warn!(path = %node_path, error = %e, "Failed to delete from under storage");
                    result.failures.push((node_path.to_string(), e.to_string()));
                    result.skipped.push(node_path.to_string());
                    mark_unsafe(&parents, &mut unsafe_ids, inode.id);
                    continue;
                }
            }

            if let Ok(file) = inode.as_file(node_path.as_str()) {
                tx.deletions().register(&file.block_ids);
                self.persist_queue.cancel(inode.id);
            }
            self.tree.delete_inode(tx.journal(), inode.id, now)?;
            result.deleted.push(node_path.to_string());
            debug!(path = %node_path, inode = inode.id, "Deleted inode");
            tx.journal().flush_if_over(self.config.recursive_flush_batch)?;
        }

        if !unsafe_ids.contains(&target.id) {
            guard.remove_last_inode();
        }
        info!(
            path = %path,
            deleted = result.deleted.len(),
            skipped = result.skipped.len(),
            failures = result.failures.len(),
            "Deleted path"
        );
        Ok(result)
    }

    /// Fail when a descendant lies under a read-only mount and under
    /// storage would be touched.
    fn check_writable(&self, path: &NamespacePath, options: &DeleteOptions) -> Result<()> {
        if options.alluxio_only {
            return Ok(());
        }
        self.mounts.check_under_writable_mount(path)
    }

    async fn delete_from_ufs(&self, inode: &Inode, path: &NamespacePath) -> Result<()> {
        let resolution = self.mounts.resolve(path)?;
        let ufs = &resolution.ufs;
        let removed = if inode.is_directory() {
            ufs.delete_directory(&resolution.ufs_path, false).await?
        } else {
            ufs.delete_file(&resolution.ufs_path).await?
        };
        if !removed && ufs.exists(&resolution.ufs_path).await? {
            return Err(CanopyError::Ufs(format!(
                "{} could not be removed from under storage",
                resolution.ufs_path
            )));
        }
        self.absent_cache.add_absent(&resolution.ufs_path);
        Ok(())
    }
}

/// Mark `id` and its ancestors within the deleted subtree as unsafe.
fn mark_unsafe(parents: &HashMap<InodeId, InodeId>, unsafe_ids: &mut HashSet<InodeId>, id: InodeId) {
    let mut current = Some(id);
    while let Some(id) = current {
        if !unsafe_ids.insert(id) {
            break;
        }
        current = parents.get(&id).copied().filter(|parent| parents.contains_key(parent));
    }
}
