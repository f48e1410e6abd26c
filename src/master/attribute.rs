//! Attribute and ACL changes.

use super::{AttributeResult, CallContext, FileSystemMaster, SetAclOptions, SetAttributeOptions};
use crate::acl::{self, AclEntry, SetAclAction};
use crate::error::{CanopyError, Result};
use crate::journal::{DirectoryUpdate, InodeUpdate, TransactionContext, XAttrPatch};
use crate::lock::{LockPattern, PathLockGuard};
use crate::metadata::Inode;
use crate::path::NamespacePath;
use crate::types::{DescendantType, ModeBits, PersistenceState};
use tracing::{debug, info, warn};

/// The guarded target followed by its descendants in pre-order.
async fn scope(guard: &PathLockGuard, recursive: bool) -> Result<Vec<(NamespacePath, Inode)>> {
    let target = guard.target()?;
    let is_directory = target.is_directory();
    let mut nodes = vec![(guard.path().clone(), target)];
    if recursive && is_directory {
        nodes.extend(guard.lock_descendants().await?.into_iter().map(|d| (d.path, d.inode)));
    }
    Ok(nodes)
}

impl FileSystemMaster {
    /// Change attributes of a path, and of its subtree with `recursive`.
    ///
    /// Descendants the caller may not modify are skipped. Ownership changes
    /// of persisted nodes are mirrored to under storage first; a mirroring
    /// failure aborts the call before that node's metadata changes.
    pub async fn set_attribute(
        &self,
        ctx: &CallContext,
        path: &NamespacePath,
        options: SetAttributeOptions,
    ) -> Result<AttributeResult> {
        let descendants = if options.recursive {
            DescendantType::All
        } else {
            DescendantType::None
        };
        self.sync_path(ctx, path, descendants).await;
        let options = &options;
        self.retry("set_attribute", path, move || async move {
            let mut tx = self.transaction();
            let result = self.set_attribute_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    pub(crate) async fn set_attribute_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        options: &SetAttributeOptions,
    ) -> Result<AttributeResult> {
        let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
        self.check_permission(ctx, &guard, ModeBits::NONE)?;
        if options.changes_ownership() {
            self.mounts.check_under_writable_mount(path)?;
        }
        let nodes = scope(&guard, options.recursive).await?;

        let mut result = AttributeResult::default();
        let mut allowed = Vec::with_capacity(nodes.len());
        for (index, (node_path, inode)) in nodes.iter().enumerate() {
            if options.persisted == Some(true) && !inode.is_completed() {
                return Err(CanopyError::PreconditionFailed(format!(
                    "Cannot mark incomplete file {} as persisted",
                    node_path
                )));
            }
            match self.check_attribute_permission(ctx, inode, node_path, options) {
                Ok(()) => allowed.push((node_path, inode)),
                Err(e) if index == 0 => return Err(e),
                Err(e) => {
                    debug!(path = %node_path, error = %e, "Skipping attribute change of a protected path");
                    result.skipped.push(node_path.to_string());
                }
            }
        }

        let mut persisted_any = false;
        for (node_path, inode) in allowed {
            ctx.cancel.check(node_path)?;
            if options.changes_ownership() && inode.is_persisted() {
                self.mirror_ownership(inode, node_path, options).await?;
            }

            let mut update = InodeUpdate {
                owner: options.owner.clone(),
                group: options.group.clone(),
                mode: options.mode,
                pinned: options.pinned,
                ttl: options.ttl,
                ttl_action: options.ttl_action,
                xattr: options.xattr.clone().map(|values| XAttrPatch {
                    strategy: options.xattr_strategy,
                    values,
                }),
                ..Default::default()
            };
            if options.persisted == Some(true) && !inode.is_persisted() {
                update.persistence_state = Some(PersistenceState::Persisted);
                self.persist_queue.cancel(inode.id);
                persisted_any = true;
            }
            if !update.is_empty() {
                self.tree.update_inode(tx.journal(), inode.id, update)?;
            }
            result.updated.push(node_path.to_string());
            tx.journal().flush_if_over(self.config.recursive_flush_batch)?;
        }

        if persisted_any {
            self.propagate_persisted(tx, &guard.inodes())?;
        }
        info!(
            path = %path,
            updated = result.updated.len(),
            skipped = result.skipped.len(),
            "Set attributes"
        );
        Ok(result)
    }

    fn check_attribute_permission(
        &self,
        ctx: &CallContext,
        inode: &Inode,
        path: &NamespacePath,
        options: &SetAttributeOptions,
    ) -> Result<()> {
        if options.changes_ownership() {
            self.permissions.check_set_attribute(
                &ctx.user,
                inode,
                options.owner.as_deref(),
                options.group.as_deref(),
                options.mode.is_some(),
                path.as_str(),
            )?;
        }
        let other = options.pinned.is_some()
            || options.ttl.is_some()
            || options.ttl_action.is_some()
            || options.persisted.is_some()
            || options.xattr.is_some();
        if other {
            self.permissions
                .check_inode(&ctx.user, inode, ModeBits::WRITE, path.as_str())?;
        }
        Ok(())
    }

    /// Apply owner, group and mode changes to the under storage copy.
    async fn mirror_ownership(&self, inode: &Inode, path: &NamespacePath, options: &SetAttributeOptions) -> Result<()> {
        if !inode.is_completed() {
            warn!(path = %path, "Not mirroring ownership of an incomplete file");
            return Ok(());
        }
        let resolution = self.mounts.resolve(path)?;
        let ufs = &resolution.ufs;
        if ufs.is_object_storage() {
            debug!(path = %path, "Object storage keeps no ownership, skipping");
            return Ok(());
        }
        if options.owner.is_some() || options.group.is_some() {
            let owner = options.owner.as_deref().unwrap_or(&inode.owner);
            let group = options.group.as_deref().unwrap_or(&inode.group);
            ufs.set_owner(&resolution.ufs_path, owner, group).await.map_err(|e| {
                CanopyError::AccessDenied(format!(
                    "Could not set the owner of {} in under storage: {}",
                    resolution.ufs_path, e
                ))
            })?;
        }
        if let Some(mode) = options.mode {
            ufs.set_mode(&resolution.ufs_path, mode).await.map_err(|e| {
                CanopyError::AccessDenied(format!(
                    "Could not set the mode of {} in under storage: {}",
                    resolution.ufs_path, e
                ))
            })?;
        }
        Ok(())
    }

    /// Change the ACL of a path, and of its subtree with `recursive`.
    ///
    /// Files in a recursive change ignore default entries.
    pub async fn set_acl(
        &self,
        ctx: &CallContext,
        path: &NamespacePath,
        action: SetAclAction,
        entries: Vec<AclEntry>,
        options: SetAclOptions,
    ) -> Result<AttributeResult> {
        if entries.is_empty() && matches!(action, SetAclAction::Modify | SetAclAction::Remove) {
            return Ok(AttributeResult::default());
        }
        let descendants = if options.recursive {
            DescendantType::All
        } else {
            DescendantType::None
        };
        self.sync_path(ctx, path, descendants).await;
        let (entries, options) = (&entries, &options);
        self.retry("set_acl", path, move || async move {
            let mut tx = self.transaction();
            let result = self.set_acl_in(ctx, &mut tx, path, action, entries, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn set_acl_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        action: SetAclAction,
        entries: &[AclEntry],
        options: &SetAclOptions,
    ) -> Result<AttributeResult> {
        let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
        self.check_permission(ctx, &guard, ModeBits::NONE)?;
        self.mounts.check_under_writable_mount(path)?;
        let nodes = scope(&guard, options.recursive).await?;
        let access_only: Vec<AclEntry> = entries.iter().filter(|e| !e.is_default).cloned().collect();

        let mut result = AttributeResult::default();
        for (index, (node_path, inode)) in nodes.iter().enumerate() {
            ctx.cancel.check(node_path)?;
            if let Err(e) = self
                .permissions
                .check_set_attribute(&ctx.user, inode, None, None, true, node_path.as_str())
            {
                if index == 0 {
                    return Err(e);
                }
                debug!(path = %node_path, error = %e, "Skipping ACL change of a protected path");
                result.skipped.push(node_path.to_string());
                continue;
            }

            let directory = inode.as_directory(node_path.as_str()).ok();
            if directory.is_none() && index > 0 && action == SetAclAction::RemoveDefault {
                continue;
            }
            let node_entries = if directory.is_none() && index > 0 {
                access_only.as_slice()
            } else {
                entries
            };
            let update = acl::apply_set_acl(
                action,
                node_entries,
                inode.mode,
                &inode.acl,
                directory.map(|d| &d.default_acl),
                directory.is_some(),
            )?;

            self.tree.update_inode(
                tx.journal(),
                inode.id,
                InodeUpdate {
                    mode: Some(update.mode),
                    acl: Some(update.acl.clone()),
                    ..Default::default()
                },
            )?;
            if let Some(default_acl) = &update.default_acl {
                self.tree.update_directory(
                    tx.journal(),
                    inode.id,
                    DirectoryUpdate {
                        default_acl: Some(default_acl.clone()),
                        ..Default::default()
                    },
                )?;
            }
            if inode.is_persisted() {
                self.mirror_acl(node_path, &update).await;
            }
            result.updated.push(node_path.to_string());
            tx.journal().flush_if_over(self.config.recursive_flush_batch)?;
        }
        info!(path = %path, action = ?action, updated = result.updated.len(), "Set ACL");
        Ok(result)
    }

    async fn mirror_acl(&self, path: &NamespacePath, update: &acl::AclUpdate) {
        let resolution = match self.mounts.resolve(path) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(path = %path, error = %e, "Could not resolve path to mirror its ACL");
                return;
            }
        };
        if resolution.ufs.is_object_storage() {
            return;
        }
        let mut entries = acl::access_entries(update.mode, &update.acl);
        if let Some(default_acl) = &update.default_acl {
            entries.extend(default_acl.entries());
        }
        if let Err(e) = resolution.ufs.set_acl_entries(&resolution.ufs_path, &entries).await {
            warn!(path = %path, error = %e, "Could not set the ACL in under storage");
        }
    }
}
