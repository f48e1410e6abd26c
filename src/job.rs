//! Persist job execution.
//!
//! The persistence pipeline hands copy work to a [`JobService`] and polls it
//! for progress. [`InMemoryJobService`] runs jobs in-process: jobs complete
//! on the first status poll (or stay where a test put them) and, when wired
//! to a [`UfsManager`], materialize the temporary object before reporting
//! completion.

use crate::error::{CanopyError, Result};
use crate::types::{InodeId, JobId, MountId};
use crate::ufs::UfsManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What a persist job copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSpec {
    pub file_id: InodeId,
    /// Namespace path of the file.
    pub path: String,
    /// Under storage path the job writes to.
    pub ufs_path: String,
    pub mount_id: MountId,
    /// Committed length of the file.
    pub length: u64,
}

/// Status of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed(String),
    Canceled,
}

/// External job execution.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submit a job. Fails with [`CanopyError::ResourceExhausted`] when the
    /// service is saturated.
    async fn submit(&self, spec: PersistSpec) -> Result<JobId>;

    /// Request cancellation. Unknown jobs fail with not-found.
    async fn cancel(&self, job_id: JobId) -> Result<()>;

    async fn status(&self, job_id: JobId) -> Result<JobStatus>;
}

struct JobRecord {
    spec: PersistSpec,
    /// Statuses returned by the next polls, front first.
    script: Vec<JobStatus>,
    last: JobStatus,
}

/// In-process job service.
pub struct InMemoryJobService {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    next_id: AtomicU64,
    reject: AtomicU64,
    ufs: Option<Arc<UfsManager>>,
}

impl InMemoryJobService {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reject: AtomicU64::new(0),
            ufs: None,
        }
    }

    /// Write the temporary object of every completed job through `ufs`.
    pub fn with_ufs(mut self, ufs: Arc<UfsManager>) -> Self {
        self.ufs = Some(ufs);
        self
    }

    /// Fail the next `count` submissions with resource exhaustion.
    pub fn reject_next(&self, count: u64) {
        self.reject.store(count, Ordering::SeqCst);
    }

    /// Statuses the next polls of `job_id` return, in order. Once drained a
    /// created or running job completes and any other status sticks.
    pub fn script(&self, job_id: JobId, statuses: Vec<JobStatus>) {
        if let Some(job) = self.jobs.lock().get_mut(&job_id) {
            job.script = statuses;
        }
    }

    /// Submitted jobs by id.
    pub fn submitted(&self) -> Vec<(JobId, PersistSpec)> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .iter()
            .map(|(id, job)| (*id, job.spec.clone()))
            .collect();
        jobs.sort_by_key(|(id, _)| *id);
        jobs
    }

    pub fn last_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.lock().get(&job_id).map(|job| job.last.clone())
    }

    async fn materialize(&self, spec: &PersistSpec) -> Result<()> {
        if let Some(ufs) = &self.ufs {
            ufs.get(spec.mount_id)?.create_file(&spec.ufs_path, spec.length).await?;
            debug!(path = %spec.ufs_path, length = spec.length, "Materialized persisted file");
        }
        Ok(())
    }
}

impl Default for InMemoryJobService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobService for InMemoryJobService {
    async fn submit(&self, spec: PersistSpec) -> Result<JobId> {
        let rejected = self
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(CanopyError::ResourceExhausted("Too many persist jobs".to_string()));
        }
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(job_id, file_id = spec.file_id, "Submitted persist job");
        self.jobs.lock().insert(
            job_id,
            JobRecord {
                spec,
                script: Vec::new(),
                last: JobStatus::Created,
            },
        );
        Ok(job_id)
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))?;
        job.script = vec![JobStatus::Canceled];
        Ok(())
    }

    async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let (status, spec) = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(&job_id)
                .ok_or_else(|| CanopyError::NotFound(format!("job {}", job_id)))?;
            let status = if job.script.is_empty() {
                match &job.last {
                    JobStatus::Created | JobStatus::Running => JobStatus::Completed,
                    other => other.clone(),
                }
            } else {
                job.script.remove(0)
            };
            job.last = status.clone();
            (status, job.spec.clone())
        };
        if status == JobStatus::Completed {
            self.materialize(&spec).await?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PersistSpec {
        PersistSpec {
            file_id: 7,
            path: "/f".into(),
            ufs_path: "mem://b/f.tmp".into(),
            mount_id: 1,
            length: 10,
        }
    }

    #[tokio::test]
    async fn test_scripted_statuses() {
        let service = InMemoryJobService::new();
        let id = service.submit(spec()).await.unwrap();
        service.script(id, vec![JobStatus::Created, JobStatus::Running, JobStatus::Failed("boom".into())]);
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Created);
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Running);
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Failed("boom".into()));
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Failed("boom".into()));
    }

    #[tokio::test]
    async fn test_unscripted_job_completes() {
        let service = InMemoryJobService::new();
        let id = service.submit(spec()).await.unwrap();
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Completed);
        service.cancel(id).await.unwrap();
        assert_eq!(service.status(id).await.unwrap(), JobStatus::Canceled);
        assert!(service.cancel(999).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejection() {
        let service = InMemoryJobService::new();
        service.reject_next(1);
        assert!(matches!(
            service.submit(spec()).await,
            Err(CanopyError::ResourceExhausted(_))
        ));
        assert!(service.submit(spec()).await.is_ok());
        assert_eq!(service.submitted().len(), 1);
    }
}
