//! Persist requests and tracked persist jobs.

use super::timer::ExponentialTimer;
use crate::path::NamespacePath;
use crate::types::{InodeId, JobId, MountId};

/// Cancellation progress of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    NotCanceled,
    /// The file went away; the checker must ask the job service to cancel.
    ToBeCanceled,
    /// Cancellation was requested; waiting for the job to report it.
    Canceling,
}

/// A file waiting for a persist job to be submitted.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub file_id: InodeId,
    pub timer: ExponentialTimer,
}

impl PersistRequest {
    pub fn new(file_id: InodeId, timer: ExponentialTimer) -> Self {
        Self { file_id, timer }
    }
}

/// A submitted persist job.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub job_id: JobId,
    pub file_id: InodeId,
    /// Namespace path of the file at submission.
    pub uri: NamespacePath,
    pub mount_id: MountId,
    /// Under storage path the job writes to.
    pub temp_ufs_path: String,
    /// Timer of the request, kept so that a failed job resumes its backoff.
    pub timer: ExponentialTimer,
    pub cancel_state: CancelState,
}

impl PersistJob {
    pub fn new(job_id: JobId, request: PersistRequest, uri: NamespacePath, mount_id: MountId, temp_ufs_path: String) -> Self {
        Self {
            job_id,
            file_id: request.file_id,
            uri,
            mount_id,
            temp_ufs_path,
            timer: request.timer,
            cancel_state: CancelState::NotCanceled,
        }
    }

    /// Turn the job back into a pending request with the same timer.
    pub fn into_request(self) -> PersistRequest {
        PersistRequest {
            file_id: self.file_id,
            timer: self.timer,
        }
    }
}
