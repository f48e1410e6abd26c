//! File and directory creation, block allocation and file completion.

use super::{CallContext, CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, DeleteOptions, FileSystemMaster};
use crate::error::{CanopyError, Result};
use crate::journal::{FileUpdate, InodeUpdate, TransactionContext, XAttrPatch};
use crate::lock::{LockPattern, PathLockGuard};
use crate::metadata::inode::{InodeKind, NewInode};
use crate::metadata::{FileInfo, Inode};
use crate::path::{ufs_parent, NamespacePath};
use crate::types::*;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What [`FileSystemMaster::create_path`] creates at the end of the path.
enum NewNode<'a> {
    File(&'a CreateFileOptions),
    Directory(&'a CreateDirectoryOptions),
}

impl NewNode<'_> {
    fn recursive(&self) -> bool {
        match self {
            NewNode::File(options) => options.recursive,
            NewNode::Directory(options) => options.recursive,
        }
    }

    fn persisted(&self) -> bool {
        match self {
            NewNode::File(options) => options.persisted,
            NewNode::Directory(options) => options.persisted,
        }
    }
}

impl FileSystemMaster {
    /// Create an empty, incomplete file.
    pub async fn create_file(&self, ctx: &CallContext, path: &NamespacePath, options: CreateFileOptions) -> Result<FileInfo> {
        if self.is_applied(ctx) {
            return self.lookup_file_info(path).await;
        }
        self.sync_path(ctx, path, DescendantType::One).await;
        let options = &options;
        self.retry("create_file", path, move || async move {
            let mut tx = self.transaction();
            let result = self.create_file_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn create_file_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        options: &CreateFileOptions,
    ) -> Result<FileInfo> {
        if path.is_root() {
            return Err(CanopyError::AlreadyExists(path.to_string()));
        }
        let mut guard = self.locks.lock_path(path, LockPattern::WriteEdge).await?;
        self.mounts.check_under_writable_mount(path)?;
        self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;

        if guard.full_path_exists() {
            let existing = guard.target()?;
            if !options.overwrite {
                return Err(CanopyError::AlreadyExists(path.to_string()));
            }
            if existing.is_directory() {
                return Err(CanopyError::AlreadyExists(format!(
                    "{} is a directory and cannot be overwritten",
                    path
                )));
            }
            let delete = DeleteOptions {
                alluxio_only: !existing.is_persisted(),
                unchecked: true,
                ..Default::default()
            };
            let removed = self.delete_locked(ctx, tx, &mut guard, &delete).await?;
            if let Some(e) = removed.failure_error() {
                return Err(e);
            }
            debug!(path = %path, inode = existing.id, "Removed file replaced by overwrite");
        }

        let inode = self.create_path(ctx, tx, &mut guard, NewNode::File(options)).await?;
        self.record_applied(ctx);
        info!(path = %path, inode = inode.id, "Created file");
        self.file_info(&inode, path)
    }

    /// Create a directory and return its id.
    pub async fn create_directory(
        &self,
        ctx: &CallContext,
        path: &NamespacePath,
        options: CreateDirectoryOptions,
    ) -> Result<InodeId> {
        if self.is_applied(ctx) {
            return Ok(self.lookup_file_info(path).await?.id);
        }
        self.sync_path(ctx, path, DescendantType::One).await;
        let options = &options;
        self.retry("create_directory", path, move || async move {
            let mut tx = self.transaction();
            let result = self.create_directory_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn create_directory_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        options: &CreateDirectoryOptions,
    ) -> Result<InodeId> {
        let mut guard = self.locks.lock_path(path, LockPattern::WriteEdge).await?;
        if guard.full_path_exists() {
            let existing = guard.target()?;
            if options.allow_exists && existing.is_directory() {
                self.record_applied(ctx);
                return Ok(existing.id);
            }
            return Err(CanopyError::AlreadyExists(path.to_string()));
        }
        self.mounts.check_under_writable_mount(path)?;
        self.check_parent_permission(ctx, &guard, ModeBits::WRITE)?;

        let inode = self.create_path(ctx, tx, &mut guard, NewNode::Directory(options)).await?;
        self.record_applied(ctx);
        info!(path = %path, inode = inode.id, "Created directory");
        Ok(inode.id)
    }

    /// Create the missing components of the guarded path.
    ///
    /// Missing intermediate directories are only created with `recursive`.
    /// When the new node is persisted, every directory above it is persisted
    /// too.
    async fn create_path(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        guard: &mut PathLockGuard,
        node: NewNode<'_>,
    ) -> Result<Inode> {
        let path = guard.path().clone();
        let components: Vec<String> = path.components().iter().map(|c| c.to_string()).collect();
        let depth = components.len();

        let last = guard.last_existing()?;
        let existing_depth = guard.existing_depth();
        if !last.is_directory() {
            return Err(CanopyError::NotADirectory(path.prefix(existing_depth).to_string()));
        }
        if existing_depth + 1 < depth && !node.recursive() {
            let parent = path.parent().unwrap_or_else(NamespacePath::root);
            return Err(CanopyError::NotFound(parent.to_string()));
        }

        let persisted = node.persisted();
        if persisted {
            let chain = guard.inodes();
            self.persist_directories(tx, &path, &chain).await?;
        }

        let now = now_ms();
        let mut parent = last;
        for (index, name) in components.iter().enumerate().skip(existing_depth) {
            let id = self.tree.next_inode_id();
            let is_leaf = index + 1 == depth;
            let inherited = parent
                .as_directory(path.prefix(index).as_str())?
                .default_acl
                .clone();

            let mut inode = match (&node, is_leaf) {
                (NewNode::File(options), true) => {
                    let new = self.new_inode(ctx, name, parent.id, options.mode, now, options.ttl, options.ttl_action, options.xattr.clone());
                    let mut file = Inode::new_file(
                        id,
                        new,
                        options.block_size_bytes.unwrap_or(self.config.block_size_bytes),
                        self.blocks.new_container_id(),
                    );
                    if persisted {
                        file.persistence_state = PersistenceState::Persisted;
                    }
                    file
                }
                (NewNode::Directory(options), true) => {
                    let new = self.new_inode(ctx, name, parent.id, options.mode, now, options.ttl, options.ttl_action, options.xattr.clone());
                    Inode::new_directory(id, new)
                }
                (_, false) => {
                    let new = self.new_inode(ctx, name, parent.id, Mode::DIRECTORY_DEFAULT, now, NO_TTL, TtlAction::Delete, HashMap::new());
                    Inode::new_directory(id, new)
                }
            };
            if !inherited.is_empty() {
                inode.mode = inherited.child_mode(inode.mode);
                inode.acl = inherited.extended.clone();
                if let InodeKind::Directory(dir) = &mut inode.kind {
                    dir.default_acl = inherited.clone();
                }
            }

            self.tree.create_inode(tx.journal(), inode.clone())?;
            guard.add_created_inode(id);
            debug!(path = %path.prefix(index + 1), inode = id, "Created inode");

            if persisted && inode.is_directory() {
                self.persist_directory(tx, &inode, &path.prefix(index + 1)).await?;
            }
            parent = self.tree.get(id).ok_or(CanopyError::InodeNotFound(id))?;
        }

        if persisted && parent.is_file() {
            let resolution = self.mounts.resolve(&path)?;
            if !resolution.read_only {
                if let Some(ufs_parent) = ufs_parent(&resolution.ufs_path) {
                    self.absent_cache.process_existing(&ufs_parent);
                }
            }
        }
        Ok(parent)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_inode(
        &self,
        ctx: &CallContext,
        name: &str,
        parent_id: InodeId,
        mode: Mode,
        time_ms: i64,
        ttl: i64,
        ttl_action: TtlAction,
        xattr: HashMap<String, Vec<u8>>,
    ) -> NewInode {
        NewInode {
            name: name.to_string(),
            parent_id,
            owner: ctx.user.user.clone(),
            group: ctx.user.primary_group().to_string(),
            mode,
            persistence_state: PersistenceState::NotPersisted,
            ttl,
            ttl_action,
            xattr,
            time_ms,
        }
    }

    /// Append a new block to an incomplete file and return its id.
    pub async fn get_new_block_id_for_file(&self, ctx: &CallContext, path: &NamespacePath) -> Result<BlockId> {
        self.retry("get_new_block_id_for_file", path, move || async move {
            let mut tx = self.transaction();
            let result = async {
                let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
                self.check_permission(ctx, &guard, ModeBits::WRITE)?;
                let inode = guard.target()?;
                let file = inode.as_file(path.as_str())?;
                if file.completed {
                    return Err(CanopyError::FileAlreadyCompleted(path.to_string()));
                }
                let sequence = file.block_ids.len() as u64;
                if sequence > max_block_sequence() {
                    return Err(CanopyError::BlockInfo(format!(
                        "{} has reached the maximum number of blocks",
                        path
                    )));
                }
                let id = block_id(file.block_container_id, sequence);
                self.tree.add_block(tx.journal(), inode.id, id)?;
                debug!(path = %path, block_id = id, "Allocated block");
                Ok(id)
            }
            .await;
            self.finish(tx, result).await
        })
        .await
    }

    /// Mark a file complete with its final length and block list.
    pub async fn complete_file(&self, ctx: &CallContext, path: &NamespacePath, options: CompleteFileOptions) -> Result<()> {
        if self.is_applied(ctx) {
            return Ok(());
        }
        let options = &options;
        self.retry("complete_file", path, move || async move {
            let mut tx = self.transaction();
            let result = self.complete_file_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn complete_file_in(
        &self,
        ctx: &CallContext,
        tx: &mut TransactionContext,
        path: &NamespacePath,
        options: &CompleteFileOptions,
    ) -> Result<()> {
        let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
        let inode = guard.target()?;
        let file = inode.as_file(path.as_str())?;

        let owns_incomplete = inode.owner == ctx.user.user && !file.completed;
        if !owns_incomplete {
            self.check_permission(ctx, &guard, ModeBits::WRITE)?;
        }
        if file.completed && file.length != LENGTH_UNKNOWN {
            return Err(CanopyError::FileAlreadyCompleted(path.to_string()));
        }

        let length = if inode.is_persisted() {
            options.ufs_length
        } else {
            let infos = self.blocks.block_infos(&file.block_ids).await?;
            if infos.len() != file.block_ids.len() {
                return Err(CanopyError::BlockInfo(format!(
                    "{} of {} blocks of {} are committed",
                    infos.len(),
                    file.block_ids.len(),
                    path
                )));
            }
            let mut length = 0i64;
            for (index, info) in infos.iter().enumerate() {
                if index + 1 < infos.len() && info.length != file.block_size_bytes {
                    return Err(CanopyError::BlockInfo(format!(
                        "Block {} of {} has length {} but the block size is {}",
                        info.block_id, path, info.length, file.block_size_bytes
                    )));
                }
                length += info.length as i64;
            }
            length
        };
        if length < 0 {
            return Err(CanopyError::InvalidFileSize(format!(
                "{} has invalid length {}",
                path, length
            )));
        }

        let mut update = InodeUpdate {
            last_modification_time_ms: Some(now_ms()),
            ..Default::default()
        };
        if inode.is_persisted() {
            let resolution = self.mounts.resolve(path)?;
            match resolution.ufs.fingerprint(&resolution.ufs_path).await {
                Ok(fingerprint) => update.ufs_fingerprint = Some(fingerprint),
                Err(e) => warn!(path = %path, error = %e, "Could not fingerprint completed file"),
            }
        }
        if let Some(hash) = &options.content_hash {
            update.xattr = Some(XAttrPatch {
                strategy: XAttrUpdateStrategy::UnionReplace,
                values: HashMap::from([(ETAG_XATTR_KEY.to_string(), hash.clone().into_bytes())]),
            });
        }
        self.tree.update_inode(tx.journal(), inode.id, update)?;
        self.tree.update_file(
            tx.journal(),
            inode.id,
            FileUpdate {
                completed: Some(true),
                length: Some(length),
                block_ids: Some(file.block_ids.clone()),
                ..Default::default()
            },
        )?;

        if let Some(persist) = &options.async_persist {
            if inode.persistence_state == PersistenceState::NotPersisted {
                self.tree.update_inode(
                    tx.journal(),
                    inode.id,
                    InodeUpdate::persistence(PersistenceState::ToBePersisted),
                )?;
                self.schedule_persist_request(inode.id, persist.initial_wait);
            }
        }
        self.record_applied(ctx);
        info!(path = %path, length, "Completed file");
        Ok(())
    }

    /// Persist a new directory in under storage.
    pub(crate) async fn persist_directory(&self, tx: &mut TransactionContext, inode: &Inode, path: &NamespacePath) -> Result<()> {
        let resolution = self.mounts.resolve(path)?;
        let options = crate::ufs::MkdirsOptions {
            create_parent: true,
            owner: inode.owner.clone(),
            group: inode.group.clone(),
            mode: inode.mode,
        };
        let ufs = &resolution.ufs;
        if !ufs.mkdirs(&resolution.ufs_path, &options).await? && !ufs.is_directory(&resolution.ufs_path).await? {
            return Err(CanopyError::Ufs(format!(
                "Failed to create directory {} in under storage",
                resolution.ufs_path
            )));
        }
        if !inode.acl.is_empty() && !ufs.is_object_storage() {
            let entries = crate::acl::access_entries(inode.mode, &inode.acl);
            if let Err(e) = ufs.set_acl_entries(&resolution.ufs_path, &entries).await {
                warn!(path = %path, error = %e, "Could not set the ACL of a persisted directory");
            }
        }
        let fingerprint = ufs.fingerprint(&resolution.ufs_path).await?;
        self.tree.update_inode(
            tx.journal(),
            inode.id,
            InodeUpdate {
                persistence_state: Some(PersistenceState::Persisted),
                ufs_fingerprint: Some(fingerprint),
                ..Default::default()
            },
        )?;
        self.absent_cache.process_existing(&resolution.ufs_path);
        debug!(path = %path, ufs_path = %resolution.ufs_path, "Persisted directory");
        Ok(())
    }

    /// Persist every directory of `chain` (root first) that is not yet
    /// persisted, top-down.
    pub(crate) async fn persist_directories(&self, tx: &mut TransactionContext, path: &NamespacePath, chain: &[Inode]) -> Result<()> {
        for (depth, inode) in chain.iter().enumerate().skip(1) {
            if inode.is_directory() && !inode.is_persisted() {
                self.persist_directory(tx, inode, &path.prefix(depth)).await?;
            }
        }
        Ok(())
    }
}
