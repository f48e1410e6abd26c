//! Submission of persist jobs for pending requests.

use super::job::{PersistJob, PersistRequest};
use super::timer::TimerTick;
use crate::error::{CanopyError, Result};
use crate::heartbeat::HeartbeatExecutor;
use crate::job::PersistSpec;
use crate::journal::{FileUpdate, InodeUpdate, TransactionContext};
use crate::lock::LockPattern;
use crate::master::FileSystemMaster;
use crate::mount::Resolution;
use crate::path::{join_ufs_path, NamespacePath};
use crate::types::{now_ms, InodeId, JobId, MountId, PersistenceState};
use crate::ufs::MkdirsOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Quiet period after the first resource exhaustion.
const MIN_QUIET_PERIOD: Duration = Duration::from_secs(1);

enum Submission {
    Submitted {
        job_id: JobId,
        uri: NamespacePath,
        mount_id: MountId,
        temp_ufs_path: String,
    },
    /// The file is gone or no longer waits for persistence.
    Dropped,
    /// Try again on a later heartbeat.
    Kept,
}

/// Heartbeat that turns ready persist requests into persist jobs.
///
/// When the job service reports resource exhaustion the scheduler backs off
/// globally: every heartbeat first sleeps a quiet period that doubles on
/// each exhaustion and halves on each successful submission.
pub struct PersistenceScheduler {
    master: Arc<FileSystemMaster>,
    quiet_period: Mutex<Duration>,
}

impl PersistenceScheduler {
    pub fn new(master: Arc<FileSystemMaster>) -> Self {
        Self {
            master,
            quiet_period: Mutex::new(Duration::ZERO),
        }
    }

    /// Current global backoff.
    pub fn quiet_period(&self) -> Duration {
        *self.quiet_period.lock()
    }

    fn increase_quiet_period(&self) {
        let max = self.master.persistence_config().max_quiet_period;
        let mut quiet = self.quiet_period.lock();
        *quiet = if quiet.is_zero() {
            MIN_QUIET_PERIOD
        } else {
            (*quiet * 2).min(max)
        };
    }

    fn decrease_quiet_period(&self) {
        let mut quiet = self.quiet_period.lock();
        *quiet /= 2;
    }

    /// Under storage path the job writes to.
    ///
    /// Object stores with direct persist write the final path; everything
    /// else writes a unique object in the mount's temporary directory.
    fn temp_ufs_path(&self, resolution: &Resolution, path: &NamespacePath) -> String {
        let config = self.master.persistence_config();
        if resolution.ufs.is_object_storage() && config.object_store_direct_persist {
            return resolution.ufs_path.clone();
        }
        let name = format!("{}.{}.{}.tmp", path.name(), now_ms(), Uuid::new_v4());
        join_ufs_path(&join_ufs_path(&resolution.mount_ufs_uri, &config.temp_dir), &name)
    }

    /// Demote a file whose persistence window passed.
    async fn expire(&self, tx: &mut TransactionContext, file_id: InodeId) -> Result<()> {
        let master = &self.master;
        let guard = match master.locks().lock_full_path_by_id(file_id, LockPattern::WriteInode).await {
            Ok(guard) => guard,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let inode = guard.target()?;
        if inode.persistence_state != PersistenceState::ToBePersisted {
            return Ok(());
        }
        master.tree().update_inode(
            tx.journal(),
            file_id,
            InodeUpdate::persistence(PersistenceState::NotPersisted),
        )?;
        master.tree().update_file(tx.journal(), file_id, FileUpdate::clear_persist_job())?;
        warn!(path = %guard.path(), file_id, "Persistence window expired, file stays not persisted");
        Ok(())
    }

    async fn submit(&self, tx: &mut TransactionContext, request: &PersistRequest) -> Result<Submission> {
        let master = &self.master;
        let guard = match master
            .locks()
            .lock_full_path_by_id(request.file_id, LockPattern::WriteInode)
            .await
        {
            Ok(guard) => guard,
            Err(e) if e.is_not_found() => {
                debug!(file_id = request.file_id, "Dropping persist request of a deleted file");
                return Ok(Submission::Dropped);
            }
            Err(e) => return Err(e),
        };
        let inode = guard.target()?;
        let path = guard.path().clone();
        if inode.persistence_state != PersistenceState::ToBePersisted {
            debug!(path = %path, state = %inode.persistence_state, "Dropping persist request");
            return Ok(Submission::Dropped);
        }
        let file = inode.as_file(path.as_str())?;

        let resolution = master.mount_table().resolve(&path)?;
        if resolution.read_only {
            debug!(path = %path, "Mount is read-only, keeping persist request");
            return Ok(Submission::Kept);
        }
        let ufs = &resolution.ufs;
        let temp_ufs_path = self.temp_ufs_path(&resolution, &path);
        if temp_ufs_path != resolution.ufs_path {
            let temp_dir = join_ufs_path(&resolution.mount_ufs_uri, &master.persistence_config().temp_dir);
            ufs.mkdirs(&temp_dir, &MkdirsOptions::default()).await?;
        }
        if let Some(stale) = &file.temp_ufs_path {
            if *stale != temp_ufs_path {
                match ufs.delete_file(stale).await {
                    Ok(_) => debug!(path = %path, stale = %stale, "Removed stale temporary object"),
                    Err(e) => warn!(path = %path, stale = %stale, error = %e, "Failed to remove stale temporary object"),
                }
            }
        }

        let spec = PersistSpec {
            file_id: inode.id,
            path: path.to_string(),
            ufs_path: temp_ufs_path.clone(),
            mount_id: resolution.mount_id,
            length: file.length.max(0) as u64,
        };
        let job_id = master.jobs().submit(spec).await?;
        master.tree().update_file(
            tx.journal(),
            inode.id,
            FileUpdate {
                persist_job_id: Some(job_id),
                temp_ufs_path: Some(Some(temp_ufs_path.clone())),
                ..Default::default()
            },
        )?;
        Ok(Submission::Submitted {
            job_id,
            uri: path,
            mount_id: resolution.mount_id,
            temp_ufs_path,
        })
    }
}

#[async_trait]
impl HeartbeatExecutor for PersistenceScheduler {
    fn name(&self) -> &str {
        "persistence-scheduler"
    }

    async fn heartbeat(&self) -> Result<()> {
        let quiet = self.quiet_period();
        if !quiet.is_zero() {
            debug!(quiet_ms = quiet.as_millis() as u64, "Persistence scheduler backing off");
            tokio::time::sleep(quiet).await;
        }

        let master = &self.master;
        let queue = master.persist_queue();
        let flush_batch = master.persistence_config().journal_flush_batch.max(1);
        let mut tx = master.transaction();
        let mut processed = 0usize;
        let mut submitted = 0usize;

        for file_id in queue.pending_ids() {
            let Some(mut request) = queue.take_pending(file_id) else {
                continue;
            };
            processed += 1;
            match request.timer.tick() {
                TimerTick::NotReady => queue.requeue(request),
                TimerTick::Expired => {
                    if let Err(e) = self.expire(&mut tx, file_id).await {
                        warn!(file_id, error = %e, "Failed to demote expired persist request");
                    }
                }
                TimerTick::Ready => match self.submit(&mut tx, &request).await {
                    Ok(Submission::Submitted {
                        job_id,
                        uri,
                        mount_id,
                        temp_ufs_path,
                    }) => {
                        self.decrease_quiet_period();
                        debug!(path = %uri, job_id, temp = %temp_ufs_path, "Submitted persist job");
                        queue.track(PersistJob::new(job_id, request, uri, mount_id, temp_ufs_path));
                        submitted += 1;
                    }
                    Ok(Submission::Dropped) => {}
                    Ok(Submission::Kept) => queue.requeue(request),
                    Err(CanopyError::ResourceExhausted(reason)) => {
                        queue.requeue(request);
                        self.increase_quiet_period();
                        warn!(
                            reason = %reason,
                            quiet_ms = self.quiet_period().as_millis() as u64,
                            "Job service exhausted, backing off"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(file_id, error = %e, "Failed to submit persist job");
                        queue.requeue(request);
                    }
                },
            }
            if processed % flush_batch == 0 {
                tx.journal().flush()?;
            }
        }
        tx.close().await?;
        if submitted > 0 {
            info!(submitted, pending = queue.pending_len(), "Persist jobs submitted");
        }
        Ok(())
    }
}
