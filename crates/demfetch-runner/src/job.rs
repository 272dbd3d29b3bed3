//! Job model and state machine.
//!
//! ```text
//! Pending → Locating → Fetching → Merging → Clipping → Complete
//!    └──────────┴──────────┴──────────┴──────────┴────→ Failed
//! ```
//!
//! `Complete` and `Failed` are terminal; a terminal job never changes again.

use chrono::{DateTime, Utc};
use demfetch_dem::{BoundingBox, ConsistencyWarning, DemError, ErrorKind, Polygon, RasterArtifact, SourceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier handed out by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Locating,
    Fetching,
    Merging,
    Clipping,
    Complete,
    Failed,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Locating => "locating",
            JobState::Fetching => "fetching",
            JobState::Merging => "merging",
            JobState::Clipping => "clipping",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    /// The stage that follows this one on success.
    pub fn next(&self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::Locating),
            JobState::Locating => Some(JobState::Fetching),
            JobState::Fetching => Some(JobState::Merging),
            JobState::Merging => Some(JobState::Clipping),
            JobState::Clipping => Some(JobState::Complete),
            JobState::Complete | JobState::Failed => None,
        }
    }

    /// Whether `to` is a legal successor of this state.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == JobState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by request")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<DemError> for JobError {
    fn from(e: DemError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One entry in a job's stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// A unit of work: one polygon against one source.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Request geometry in the canonical CRS.
    pub polygon: Polygon,
    pub source: SourceId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<RasterArtifact>,
    pub error: Option<JobError>,
    pub warnings: Vec<ConsistencyWarning>,
    pub stage_history: Vec<StageRecord>,
    pub cancel_requested: bool,
    /// Tiles located for this job, once known.
    pub tiles: Option<usize>,
}

impl Job {
    pub fn new(id: JobId, polygon: Polygon, source: SourceId) -> Self {
        let now = Utc::now();
        Self {
            id,
            polygon,
            source,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            artifact: None,
            error: None,
            warnings: Vec::new(),
            stage_history: vec![StageRecord {
                state: JobState::Pending,
                at: now,
            }],
            cancel_requested: false,
            tiles: None,
        }
    }

    /// Move to `to`, recording the transition.
    ///
    /// Returns `false` and leaves the job untouched for illegal transitions.
    pub fn advance(&mut self, to: JobState) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        let now = Utc::now();
        self.state = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.stage_history.push(StageRecord { state: to, at: now });
        true
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            source: self.source.clone(),
            state: self.state,
            bbox: self.polygon.bbox(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            artifact: self.artifact.clone(),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
            stage_history: self.stage_history.clone(),
            cancel_requested: self.cancel_requested,
            tiles: self.tiles,
        }
    }
}

/// Point-in-time snapshot returned by `poll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub source: SourceId,
    pub state: JobState,
    /// Bounding box of the request polygon.
    pub bbox: BoundingBox,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<RasterArtifact>,
    pub error: Option<JobError>,
    pub warnings: Vec<ConsistencyWarning>,
    pub stage_history: Vec<StageRecord>,
    pub cancel_requested: bool,
    pub tiles: Option<usize>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
