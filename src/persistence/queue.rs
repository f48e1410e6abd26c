//! Pending persist requests and tracked persist jobs.

use super::job::{CancelState, PersistJob, PersistRequest};
use crate::types::{InodeId, JobId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<InodeId, PersistRequest>,
    tracked: BTreeMap<InodeId, PersistJob>,
}

/// Owner of the persist request and job maps.
///
/// A file id is in at most one of the two maps: scheduling a file that
/// already has a tracked job is a no-op, and tracking a job removes the
/// pending request it came from.
#[derive(Default)]
pub struct PersistQueue {
    state: Mutex<QueueState>,
}

impl PersistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. Returns `false` if a job for the file is in flight.
    pub fn schedule(&self, request: PersistRequest) -> bool {
        let mut state = self.state.lock();
        if state.tracked.contains_key(&request.file_id) {
            debug!(file_id = request.file_id, "Persist job already in flight");
            return false;
        }
        state.pending.insert(request.file_id, request);
        true
    }

    /// Ids of the pending requests in id order.
    pub fn pending_ids(&self) -> Vec<InodeId> {
        self.state.lock().pending.keys().copied().collect()
    }

    /// Take a pending request out for processing.
    pub fn take_pending(&self, file_id: InodeId) -> Option<PersistRequest> {
        self.state.lock().pending.remove(&file_id)
    }

    /// Put a request back, unless a job was tracked for the file meanwhile.
    pub fn requeue(&self, request: PersistRequest) {
        let mut state = self.state.lock();
        if !state.tracked.contains_key(&request.file_id) {
            state.pending.insert(request.file_id, request);
        }
    }

    /// Start tracking a submitted job.
    pub fn track(&self, job: PersistJob) {
        let mut state = self.state.lock();
        state.pending.remove(&job.file_id);
        state.tracked.insert(job.file_id, job);
    }

    /// Ids of the tracked jobs' files in id order.
    pub fn tracked_ids(&self) -> Vec<InodeId> {
        self.state.lock().tracked.keys().copied().collect()
    }

    pub fn tracked(&self, file_id: InodeId) -> Option<PersistJob> {
        self.state.lock().tracked.get(&file_id).cloned()
    }

    pub fn untrack(&self, file_id: InodeId) -> Option<PersistJob> {
        self.state.lock().tracked.remove(&file_id)
    }

    pub fn set_cancel_state(&self, file_id: InodeId, cancel_state: CancelState) {
        if let Some(job) = self.state.lock().tracked.get_mut(&file_id) {
            job.cancel_state = cancel_state;
        }
    }

    /// Stop persisting a file: drop its pending request, or mark its job to
    /// be canceled by the checker.
    pub fn cancel(&self, file_id: InodeId) {
        let mut state = self.state.lock();
        if state.pending.remove(&file_id).is_some() {
            debug!(file_id, "Dropped pending persist request");
        }
        if let Some(job) = state.tracked.get_mut(&file_id) {
            if job.cancel_state == CancelState::NotCanceled {
                job.cancel_state = CancelState::ToBeCanceled;
                debug!(file_id, job_id = job.job_id, "Persist job marked for cancellation");
            }
        }
    }

    pub fn is_pending(&self, file_id: InodeId) -> bool {
        self.state.lock().pending.contains_key(&file_id)
    }

    pub fn is_tracked(&self, file_id: InodeId) -> bool {
        self.state.lock().tracked.contains_key(&file_id)
    }

    /// Job id of the tracked job of a file.
    pub fn job_id(&self, file_id: InodeId) -> Option<JobId> {
        self.state.lock().tracked.get(&file_id).map(|job| job.job_id)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn tracked_len(&self) -> usize {
        self.state.lock().tracked.len()
    }
}
