//! Polling of tracked persist jobs and finalization of completed ones.

use super::job::{CancelState, PersistJob};
use crate::error::{CanopyError, Result};
use crate::heartbeat::HeartbeatExecutor;
use crate::job::JobStatus;
use crate::journal::{FileUpdate, InodeUpdate, TransactionContext};
use crate::lock::LockPattern;
use crate::master::FileSystemMaster;
use crate::types::{InodeId, PersistenceState};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Heartbeat that follows submitted persist jobs to completion.
pub struct PersistenceChecker {
    master: Arc<FileSystemMaster>,
}

impl PersistenceChecker {
    pub fn new(master: Arc<FileSystemMaster>) -> Self {
        Self { master }
    }

    /// Request cancellation of a job whose file went away.
    ///
    /// Returns `false` when the job is no longer tracked.
    async fn cancel(&self, job: &PersistJob) -> bool {
        let queue = self.master.persist_queue();
        match self.master.jobs().cancel(job.job_id).await {
            Ok(()) => {
                queue.set_cancel_state(job.file_id, CancelState::Canceling);
                debug!(job_id = job.job_id, file_id = job.file_id, "Requested persist job cancellation");
                true
            }
            Err(e) if e.is_not_found() => {
                queue.untrack(job.file_id);
                debug!(job_id = job.job_id, "Persist job to cancel is unknown, dropping it");
                false
            }
            Err(e) => {
                warn!(job_id = job.job_id, error = %e, "Failed to cancel persist job");
                true
            }
        }
    }

    async fn check(&self, file_id: InodeId) {
        let queue = self.master.persist_queue();
        let Some(job) = queue.tracked(file_id) else {
            return;
        };
        if job.cancel_state == CancelState::ToBeCanceled && !self.cancel(&job).await {
            return;
        }

        match self.master.jobs().status(job.job_id).await {
            Ok(JobStatus::Created) | Ok(JobStatus::Running) => {}
            Ok(JobStatus::Failed(reason)) => {
                warn!(path = %job.uri, job_id = job.job_id, reason = %reason, "Persist job failed");
                if let Some(job) = queue.untrack(file_id) {
                    if job.cancel_state == CancelState::NotCanceled {
                        queue.requeue(job.into_request());
                    }
                }
            }
            Ok(JobStatus::Canceled) => {
                debug!(path = %job.uri, job_id = job.job_id, "Persist job canceled");
                queue.untrack(file_id);
            }
            Ok(JobStatus::Completed) => {
                if let Some(job) = queue.untrack(file_id) {
                    self.handle_success(job).await;
                }
            }
            Err(e) => {
                warn!(path = %job.uri, job_id = job.job_id, error = %e, "Failed to poll persist job");
                if let Some(job) = queue.untrack(file_id) {
                    if job.cancel_state == CancelState::NotCanceled {
                        queue.requeue(job.into_request());
                    }
                }
            }
        }
    }

    async fn handle_success(&self, job: PersistJob) {
        let mut tx = self.master.transaction();
        let result = self.finalize(&mut tx, &job).await;
        let result = match (result, tx.close().await) {
            (Ok(finalized), Ok(())) => Ok(finalized),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        };
        match result {
            Ok(true) => {}
            Ok(false) => self.remove_temp(&job).await,
            Err(e) if !self.master.tree().contains(job.file_id) => {
                debug!(path = %job.uri, error = %e, "File of a completed persist job is gone");
                self.remove_temp(&job).await;
            }
            Err(e) => {
                warn!(path = %job.uri, job_id = job.job_id, error = %e, "Failed to finalize persisted file, retrying");
                self.remove_temp(&job).await;
                self.master.persist_queue().requeue(job.into_request());
            }
        }
    }

    /// Move the job's output into place and mark the file persisted.
    ///
    /// Returns `false` when the file no longer waits for persistence.
    async fn finalize(&self, tx: &mut TransactionContext, job: &PersistJob) -> Result<bool> {
        let master = &self.master;
        let guard = master
            .locks()
            .lock_full_path_by_id(job.file_id, LockPattern::WriteInode)
            .await?;
        let inode = guard.target()?;
        let path = guard.path().clone();
        if inode.persistence_state != PersistenceState::ToBePersisted {
            debug!(path = %path, state = %inode.persistence_state, "Skipping finalization");
            return Ok(false);
        }
        let file = inode.as_file(path.as_str())?;

        let resolution = master.mount_table().resolve(&path)?;
        let ufs = &resolution.ufs;
        let temp = job.temp_ufs_path.as_str();
        if !ufs.is_object_storage() {
            ufs.set_owner(temp, &inode.owner, &inode.group).await?;
            ufs.set_mode(temp, inode.mode).await?;
        }
        if master.persistence_config().validate_length {
            let status = ufs.get_status(temp).await?;
            if status.length as i64 != file.length {
                return Err(CanopyError::Ufs(format!(
                    "{} has length {} in under storage but {} in the namespace",
                    temp, status.length, file.length
                )));
            }
        }

        let chain = guard.inodes();
        if temp != resolution.ufs_path {
            master.persist_directories(tx, &path, &chain).await?;
            if ufs.exists(&resolution.ufs_path).await? {
                ufs.delete_file(&resolution.ufs_path).await?;
            }
            if !ufs.rename_renamable_file(temp, &resolution.ufs_path).await? {
                return Err(CanopyError::Ufs(format!(
                    "Failed to rename {} to {}",
                    temp, resolution.ufs_path
                )));
            }
        }

        let fingerprint = ufs.fingerprint(&resolution.ufs_path).await?;
        master.tree().update_file(tx.journal(), inode.id, FileUpdate::clear_persist_job())?;
        master.tree().update_inode(
            tx.journal(),
            inode.id,
            InodeUpdate {
                persistence_state: Some(PersistenceState::Persisted),
                ufs_fingerprint: Some(fingerprint),
                ..Default::default()
            },
        )?;
        master.propagate_persisted(tx, &guard.inodes())?;
        master.absent_cache().process_existing(&resolution.ufs_path);
        info!(path = %path, ufs_path = %resolution.ufs_path, job_id = job.job_id, "Persisted file");
        Ok(true)
    }

    /// Best-effort removal of a job's temporary object.
    async fn remove_temp(&self, job: &PersistJob) {
        let ufs = match self.master.mount_table().ufs_manager().get(job.mount_id) {
            Ok(ufs) => ufs,
            Err(e) => {
                debug!(mount_id = job.mount_id, error = %e, "Mount of a persist job is gone");
                return;
            }
        };
        match ufs.delete_file(&job.temp_ufs_path).await {
            Ok(true) => debug!(temp = %job.temp_ufs_path, "Removed temporary object"),
            Ok(false) => {}
            Err(e) => warn!(temp = %job.temp_ufs_path, error = %e, "Failed to remove temporary object"),
        }
    }
}

#[async_trait]
impl HeartbeatExecutor for PersistenceChecker {
    fn name(&self) -> &str {
        "persistence-checker"
    }

    async fn heartbeat(&self) -> Result<()> {
        for file_id in self.master.persist_queue().tracked_ids() {
            self.check(file_id).await;
        }
        Ok(())
    }
}
