//! Mount, unmount and mount option updates.

use super::{CallContext, DeleteOptions, FileSystemMaster};
use crate::error::{CanopyError, Result};
use crate::journal::TransactionContext;
use crate::lock::LockPattern;
use crate::metadata::inode::{InodeKind, NewInode};
use crate::metadata::Inode;
use crate::mount::{MountInfo, MountOptions};
use crate::path::NamespacePath;
use crate::types::{now_ms, Mode, ModeBits, MountId, PersistenceState, TtlAction, NO_TTL};
use std::collections::HashMap;
use tracing::{info, warn};

impl FileSystemMaster {
    /// Mount `ufs_uri` at `path`, which must not exist yet.
    pub async fn mount(&self, ctx: &CallContext, path: &NamespacePath, ufs_uri: &str, options: MountOptions) -> Result<MountId> {
        let options = &options;
        self.retry("mount", path, move || async move {
            let mut tx = self.transaction();
            let result = self.mount_in(ctx, &mut tx, path, ufs_uri, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn mount_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        ufs_uri: &str,
        options: &MountOptions,
    ) -> Result<MountId> {
        if path.is_root() {
            return Err(CanopyError::InvalidPath("The root is always mounted".to_string()));
        }
        let mut guard = self.locks.lock_path(path, LockPattern::WriteEdge).await?;
        if guard.full_path_exists() {
            return Err(CanopyError::AlreadyExists(format!(
                "Mount point {} already exists",
                path
            )));
        }
        let parent = guard.parent()?;
        if !parent.is_directory() {
            return Err(CanopyError::NotADirectory(
                path.parent().unwrap_or_else(NamespacePath::root).to_string(),
            ));
        }
        self.mounts.check_under_writable_mount(path)?;
        self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;

        let mount_id = self.mounts.new_mount_id();
        let ufs_manager = self.mounts.ufs_manager();
        let ufs = ufs_manager.add_mount(mount_id, ufs_uri, options)?;
        let status = match ufs.is_directory(ufs_uri).await {
            Ok(true) => ufs.get_status(ufs_uri).await.ok(),
            Ok(false) => {
                ufs_manager.remove_mount(mount_id);
                return Err(CanopyError::InvalidPath(format!(
                    "Under storage path {} does not exist or is not a directory",
                    ufs_uri
                )));
            }
            Err(e) => {
                ufs_manager.remove_mount(mount_id);
                return Err(e);
            }
        };
        let fingerprint = match ufs.fingerprint(ufs_uri).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                ufs_manager.remove_mount(mount_id);
                return Err(e);
            }
        };

        let info = MountInfo {
            path: path.to_string(),
            ufs_uri: ufs_uri.to_string(),
            mount_id,
            options: options.clone(),
        };
        if let Err(e) = self.mounts.add(tx.journal(), info) {
            ufs_manager.remove_mount(mount_id);
            return Err(e);
        }

        let (owner, group, mode) = match status {
            Some(status) if !status.owner.is_empty() => (status.owner, status.group, status.mode),
            _ => (
                ctx.user.user.clone(),
                ctx.user.primary_group().to_string(),
                Mode::DIRECTORY_DEFAULT,
            ),
        };
        let id = self.tree.next_inode_id();
        let mut inode = Inode::new_directory(
            id,
            NewInode {
                name: path.name().to_string(),
                parent_id: parent.id,
                owner,
                group,
                mode,
                persistence_state: PersistenceState::Persisted,
                ttl: NO_TTL,
                ttl_action: TtlAction::Delete,
                xattr: HashMap::new(),
                time_ms: now_ms(),
            },
        );
        inode.ufs_fingerprint = fingerprint;
        if let InodeKind::Directory(dir) = &mut inode.kind {
            dir.mount_point = true;
        }
        if let Err(e) = self.tree.create_inode(tx.journal(), inode) {
            warn!(path = %path, error = %e, "Reverting mount after failing to create its inode");
            if let Err(revert) = self.mounts.delete(tx.journal(), path) {
                warn!(path = %path, error = %revert, "Failed to revert mount");
            }
            return Err(e);
        }
        guard.add_created_inode(id);
        info!(path = %path, ufs_uri, mount_id, read_only = options.read_only, "Mounted");
        Ok(mount_id)
    }

    /// Remove the mount at `path` and its inodes, leaving under storage
    /// untouched.
    pub async fn unmount(&self, ctx: &CallContext, path: &NamespacePath) -> Result<()> {
        self.retry("unmount", path, move || async move {
            let mut tx = self.transaction();
            let result = self.unmount_in(ctx, &mut tx, path).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn unmount_in(&self, ctx: &CallContext, tx: &mut TransactionContext, path: &NamespacePath) -> Result<()> {
        if path.is_root() {
            return Err(CanopyError::InvalidPath("Cannot unmount the root mount point".to_string()));
        }
        let mut guard = self.locks.lock_path(path, LockPattern::WriteEdge).await?;
        guard.target()?;
        if !self.mounts.is_mount_point(path) {
            return Err(CanopyError::InvalidPath(format!("{} is not a mount point", path)));
        }
        if self.mounts.mounts_under(path).len() > 1 {
            return Err(CanopyError::InvalidPath(format!(
                "Cannot unmount {} because it contains nested mount points",
                path
            )));
        }
        self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;

        let options = DeleteOptions {
            recursive: true,
            alluxio_only: true,
            unchecked: true,
            delete_mount_point: true,
            skip_not_persisted: false,
        };
        let result = self.delete_locked(ctx, tx, &mut guard, &options).await?;
        info!(path = %path, inodes = result.deleted.len(), "Unmounted");
        Ok(())
    }

    /// Replace the options of the mount at `path`.
    pub async fn update_mount(&self, ctx: &CallContext, path: &NamespacePath, options: MountOptions) -> Result<()> {
        let options = &options;
        self.retry("update_mount", path, move || async move {
            let mut tx = self.transaction();
            let result = async {
                let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
                guard.target()?;
                if !self.mounts.is_mount_point(path) {
                    return Err(CanopyError::InvalidPath(format!("{} is not a mount point", path)));
                }
                self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;
                self.mounts.update(tx.journal(), path, options.clone())?;
                info!(path = %path, read_only = options.read_only, "Updated mount options");
                Ok(())
            }
            .await;
            self.finish(tx, result).await
        })
        .await
    }

    /// Unmount `path` if mounted, then mount `ufs_uri` there.
    pub async fn remount(&self, ctx: &CallContext, path: &NamespacePath, ufs_uri: &str, options: MountOptions) -> Result<MountId> {
        if self.mounts.is_mount_point(path) {
            self.unmount(ctx, path).await?;
        }
        self.mount(ctx, path, ufs_uri, options).await
    }
}
