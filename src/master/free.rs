//! Releasing cached blocks of persisted files.

use super::{CallContext, FileSystemMaster, FreeOptions};
use crate::error::{CanopyError, Result};
use crate::journal::{InodeUpdate, TransactionContext};
use crate::lock::LockPattern;
use crate::metadata::Inode;
use crate::path::NamespacePath;
use crate::types::{BlockId, DescendantType, ModeBits};
use tracing::info;

impl FileSystemMaster {
    /// Drop the cached blocks of a file, or of every file below a directory.
    ///
    /// Under storage copies are kept, so every freed file must be persisted.
    pub async fn free(&self, ctx: &CallContext, path: &NamespacePath, options: FreeOptions) -> Result<()> {
        let descendants = if options.recursive {
            DescendantType::All
        } else {
            DescendantType::One
        };
        self.sync_path(ctx, path, descendants).await;
        let options = &options;
        self.retry("free", path, move || async move {
            let mut tx = self.transaction();
            let result = self.free_in(ctx, &mut tx, path, options).await;
            self.finish(tx, result).await
        })
        .await
    }

    async fn free_in(&self, ctx: &CallContext, tx: &mut TransactionContext, path: &NamespacePath, options: &FreeOptions) -> Result<()> {
        let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
        self.check_permission(ctx, &guard, ModeBits::READ)?;
        let target = guard.target()?;
        if target.is_directory() && target.child_count() > 0 && !options.recursive {
            return Err(CanopyError::PreconditionFailed(format!(
                "Cannot free directory {} which is not empty; set recursive to free it",
                path
            )));
        }

        let mut nodes: Vec<(NamespacePath, Inode)> = vec![(path.clone(), target.clone())];
        if target.is_directory() {
            nodes.extend(guard.lock_descendants().await?.into_iter().map(|d| (d.path, d.inode)));
        }

        let files: Vec<&(NamespacePath, Inode)> = nodes.iter().filter(|(_, inode)| inode.is_file()).collect();
        for (file_path, inode) in &files {
            if !inode.is_persisted() {
                return Err(CanopyError::PreconditionFailed(format!(
                    "Cannot free file {} which is not persisted",
                    file_path
                )));
            }
            if inode.pinned && !options.forced {
                return Err(CanopyError::PreconditionFailed(format!(
                    "Cannot free pinned file {}; set forced to free it",
                    file_path
                )));
            }
        }

        let mut blocks: Vec<BlockId> = Vec::new();
        for (file_path, inode) in files {
            ctx.cancel.check(file_path)?;
            if inode.pinned {
                self.tree.update_inode(
                    tx.journal(),
                    inode.id,
                    InodeUpdate {
                        pinned: Some(false),
                        ..Default::default()
                    },
                )?;
            }
            blocks.extend_from_slice(inode.block_ids());
        }
        self.blocks.remove_blocks(&blocks, false).await?;
        info!(path = %path, blocks = blocks.len(), "Freed path");
        Ok(())
    }
}
