//! Explicit persistence requests and persisted-state propagation.

use super::{CallContext, FileSystemMaster, ScheduleAsyncPersistenceOptions};
use crate::error::{CanopyError, Result};
use crate::journal::{InodeUpdate, TransactionContext};
use crate::lock::LockPattern;
use crate::metadata::Inode;
use crate::path::NamespacePath;
use crate::types::{ModeBits, PersistenceState};
use tracing::{debug, info};

impl FileSystemMaster {
    /// Queue a completed file for asynchronous persistence.
    pub async fn schedule_async_persistence(
        &self,
        ctx: &CallContext,
        path: &NamespacePath,
        options: ScheduleAsyncPersistenceOptions,
    ) -> Result<()> {
        let options = &options;
        self.retry("schedule_async_persistence", path, move || async move {
            let mut tx = self.transaction();
            let result = async {
                let guard = self.locks.lock_path(path, LockPattern::WriteInode).await?;
                let inode = guard.target()?;
                let file = inode.as_file(path.as_str())?;
                if !file.completed {
                    return Err(CanopyError::PreconditionFailed(format!(
                        "Cannot persist incomplete file {}",
                        path
                    )));
                }
                self.check_permission(ctx, &guard, ModeBits::WRITE)?;
                if inode.is_persisted() {
                    debug!(path = %path, "File is already persisted");
                    return Ok(());
                }
                self.tree.update_inode(
                    tx.journal(),
                    inode.id,
                    InodeUpdate::persistence(PersistenceState::ToBePersisted),
                )?;
                self.schedule_persist_request(inode.id, options.initial_wait);
                info!(path = %path, inode = inode.id, "Scheduled asynchronous persistence");
                Ok(())
            }
            .await;
            self.finish(tx, result).await
        })
        .await
    }

    /// Mark the ancestors in `chain` (root first, the persisted node last)
    /// as persisted, deepest first, stopping at the first one that already
    /// is. The root and the node itself are left alone.
    pub(crate) fn propagate_persisted(&self, tx: &mut TransactionContext, chain: &[Inode]) -> Result<()> {
        if chain.len() < 3 {
            return Ok(());
        }
        for ancestor in chain[1..chain.len() - 1].iter().rev() {
            if ancestor.is_persisted() {
                break;
            }
            self.tree.update_inode(
                tx.journal(),
                ancestor.id,
                InodeUpdate::persistence(PersistenceState::Persisted),
            )?;
            debug!(inode = ancestor.id, "Marked ancestor persisted");
        }
        Ok(())
    }
}
