//! Rename with compensation on under storage failure.

use super::{CallContext, DeleteOptions, FileSystemMaster, RenameOptions};
use crate::error::{CanopyError, Result};
use crate::journal::{InodeUpdate, TransactionContext};
use crate::lock::LockPattern;
use crate::metadata::Inode;
use crate::path::NamespacePath;
use crate::types::{now_ms, DescendantType, ModeBits, PersistenceState};
use tracing::{debug, info, warn};

impl FileSystemMaster {
    /// Move `src` to `dst`.
    pub async fn rename(&self, ctx: &CallContext, src: &NamespacePath, dst: &NamespacePath, options: RenameOptions) -> Result<()> {
        if self.is_applied(ctx) {
            return Ok(());
        }
        self.sync_path(ctx, src, DescendantType::One).await;
        self.sync_path(ctx, dst, DescendantType::One).await;
        let options = &options;
        self.retry("rename", src, move || async move {
            let mut tx = self.transaction();
            let result = self.rename_in(ctx, &mut tx, src, dst, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn rename_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        src: &NamespacePath,
        dst: &NamespacePath,
        options: &RenameOptions,
    ) -> Result<()> {
        if src.is_root() || dst.is_root() {
            return Err(CanopyError::InvalidPath("Cannot rename to or from the root".to_string()));
        }
        if src == dst {
            let guard = self.locks.lock_path(src, LockPattern::Read).await?;
            guard.target()?;
            self.record_applied(ctx);
            return Ok(());
        }

        let mut pair = self.locks.lock_path_pair(src, dst, LockPattern::WriteEdge).await?;
        let source = pair.src().target()?;
        let dst_parent = pair.dst().parent()?;
        if !dst_parent.is_directory() {
            return Err(CanopyError::NotADirectory(
                dst.parent().unwrap_or_else(NamespacePath::root).to_string(),
            ));
        }
        self.check_parent_permission(ctx, pair.src(), ModeBits::WRITE)?;
        self.check_parent_permission(ctx, pair.dst(), ModeBits::WRITE)?;
        self.mounts.check_under_writable_mount(src)?;
        self.mounts.check_under_writable_mount(dst)?;

        let src_resolution = self.mounts.resolve(src)?;
        let dst_resolution = self.mounts.resolve(dst)?;
        if src_resolution.mount_id != dst_resolution.mount_id {
            return Err(CanopyError::InvalidPath(format!(
                "Renaming {} to {} is a mount point move or crosses mount points",
                src, dst
            )));
        }

        if pair.dst().full_path_exists() {
            let existing = pair.dst().target()?;
            if self.mounts.is_mount_point(dst) {
                return Err(CanopyError::InvalidPath(format!(
                    "{} is an existing mount point",
                    dst
                )));
            }
            if !(options.s3_syntax && options.overwrite && existing.is_file() && source.is_file()) {
                return Err(CanopyError::AlreadyExists(dst.to_string()));
            }
            let delete = DeleteOptions {
                alluxio_only: !existing.is_persisted(),
                unchecked: true,
                ..Default::default()
            };
            let removed = self.delete_locked(ctx, tx, pair.dst_mut(), &delete).await?;
            if let Some(e) = removed.failure_error() {
                return Err(e);
            }
        }

        if source.is_persisted() {
            let chain = pair.dst().inodes();
            self.persist_directories(tx, dst, &chain).await?;
        }

        let now = now_ms();
        self.tree.rename(tx.journal(), source.id, dst_parent.id, dst.name(), now)?;

        if source.is_persisted() {
            let ufs = &src_resolution.ufs;
            let renamed = if source.is_directory() {
                ufs.rename_directory(&src_resolution.ufs_path, &dst_resolution.ufs_path).await
            } else {
                ufs.rename_renamable_file(&src_resolution.ufs_path, &dst_resolution.ufs_path).await
            };
            let failure = match renamed {
                Ok(true) => None,
                Ok(false) => Some("the under storage rejected the rename".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                warn!(src = %src, dst = %dst, reason = %reason, "Under storage rename failed, reverting");
                self.tree.rename(tx.journal(), source.id, source.parent_id, src.name(), now)?;
                return Err(CanopyError::Ufs(format!(
                    "Failed to rename {} to {} in under storage: {}",
                    src_resolution.ufs_path, dst_resolution.ufs_path, reason
                )));
            }
            self.absent_cache.add_absent(&src_resolution.ufs_path);
            self.absent_cache.process_existing(&dst_resolution.ufs_path);
        }

        if options.persist {
            pair.dst_mut().add_created_inode(source.id);
            let mut files: Vec<(NamespacePath, Inode)> = Vec::new();
            if let Some(moved) = self.tree.get(source.id) {
                files.push((dst.clone(), moved));
            }
            if source.is_directory() {
                files.extend(
                    pair.dst()
                        .lock_descendants()
                        .await?
                        .into_iter()
                        .map(|d| (d.path, d.inode)),
                );
            }
            for (path, inode) in files {
                if self.should_persist_on_rename(&inode, &path) {
                    self.tree.update_inode(
                        tx.journal(),
                        inode.id,
                        InodeUpdate::persistence(PersistenceState::ToBePersisted),
                    )?;
                    self.schedule_persist_request(inode.id, None);
                }
            }
        }

        self.record_applied(ctx);
        info!(src = %src, dst = %dst, inode = source.id, "Renamed path");
        Ok(())
    }

    fn should_persist_on_rename(&self, inode: &Inode, path: &NamespacePath) -> bool {
        if !inode.is_file() || !inode.is_completed() || inode.persistence_state != PersistenceState::NotPersisted {
            return false;
        }
        if let Some(pattern) = self
            .config
            .persist_blacklist
            .iter()
            .find(|pattern| path.as_str().contains(pattern.as_str()))
        {
            debug!(path = %path, pattern = %pattern, "Not persisting blacklisted path");
            return false;
        }
        true
    }
}
