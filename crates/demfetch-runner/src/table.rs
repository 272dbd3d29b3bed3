//! Shared job table.
//!
//! All job mutation goes through this table so that a terminal job can never
//! be modified and waiters are woken on every change.

use crate::error::OrchestratorError;
use crate::job::{Job, JobError, JobId, JobState, JobStatus};
use chrono::Utc;
use demfetch_dem::{ConsistencyWarning, Polygon, RasterArtifact, SourceId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TableInner {
    jobs: HashMap<JobId, Job>,
    next_id: u64,
}

/// Jobs by id, with blocking waits on state changes.
#[derive(Debug, Default)]
pub struct JobTable {
    inner: Mutex<TableInner>,
    changed: Condvar,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `Pending` job.
    pub fn insert(&self, polygon: Polygon, source: SourceId) -> JobId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = JobId(inner.next_id);
        inner.jobs.insert(id, Job::new(id, polygon, source));
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner.lock().jobs.get(&id).map(Job::status)
    }

    /// Advance a job to its next stage.
    pub fn transition(&self, id: JobId, to: JobState) -> Result<(), OrchestratorError> {
        self.update(id, |job| {
            let from = job.state;
            if job.advance(to) {
                Ok(())
            } else {
                Err(OrchestratorError::InvalidTransition { job: id, from, to })
            }
        })
    }

    pub fn set_tiles(&self, id: JobId, tiles: usize) -> Result<(), OrchestratorError> {
        self.update(id, |job| {
            job.tiles = Some(tiles);
            Ok(())
        })
    }

    pub fn add_warnings(
        &self,
        id: JobId,
        warnings: &[ConsistencyWarning],
    ) -> Result<(), OrchestratorError> {
        self.update(id, |job| {
            job.warnings.extend_from_slice(warnings);
            Ok(())
        })
    }

    /// Finish a job successfully. Only legal from `Clipping`.
    pub fn complete(&self, id: JobId, artifact: RasterArtifact) -> Result<(), OrchestratorError> {
        self.update(id, |job| {
            let from = job.state;
            if !job.advance(JobState::Complete) {
                return Err(OrchestratorError::InvalidTransition {
                    job: id,
                    from,
                    to: JobState::Complete,
                });
            }
            job.artifact = Some(artifact);
            Ok(())
        })
    }

    /// Finish a job with an error. Fails if the job is already terminal.
    pub fn fail(&self, id: JobId, error: JobError) -> Result<(), OrchestratorError> {
        self.update(id, |job| {
            let from = job.state;
            if !job.advance(JobState::Failed) {
                return Err(OrchestratorError::InvalidTransition {
                    job: id,
                    from,
                    to: JobState::Failed,
                });
            }
            job.error = Some(error);
            Ok(())
        })
    }

    /// Flag a job for cancellation at its next stage boundary.
    ///
    /// Returns the job's status; terminal jobs are left unchanged.
    pub fn request_cancel(&self, id: JobId) -> Result<JobStatus, OrchestratorError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;
        if !job.state.is_terminal() {
            job.cancel_requested = true;
            job.updated_at = Utc::now();
        }
        Ok(job.status())
    }

    pub fn is_cancel_requested(&self, id: JobId) -> bool {
        self.inner
            .lock()
            .jobs
            .get(&id)
            .map_or(false, |job| job.cancel_requested)
    }

    /// Block until the job is terminal or `timeout` elapses.
    ///
    /// Returns the latest status either way; callers check
    /// [`JobStatus::is_terminal`].
    pub fn wait_terminal(&self, id: JobId, timeout: Duration) -> Result<JobStatus, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let status = inner
                .jobs
                .get(&id)
                .map(Job::status)
                .ok_or(OrchestratorError::NotFound(id))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner
                    .jobs
                    .get(&id)
                    .map(Job::status)
                    .ok_or(OrchestratorError::NotFound(id));
            }
        }
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| job.finished_at.map_or(true, |at| at > cutoff));
        before - inner.jobs.len()
    }

    fn update<F>(&self, id: JobId, f: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(&mut Job) -> Result<(), OrchestratorError>,
    {
        let result = {
            let mut inner = self.inner.lock();
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or(OrchestratorError::NotFound(id))?;
            f(job)
        };
        self.changed.notify_all();
        result
    }
}
