//! Remote execution backends.

mod ray;

pub use ray::RayJobClient;

use std::fmt;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::job::Submission;

/// Job state, normalized from the backend's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status label written to the control object.
///
/// Identical to the job state, except that a stopped job is reported as
/// `KILL` so downstream consumers can tell cancellation apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    State(JobState),
    Kill,
}

impl ReportedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State(state) => state.as_str(),
            Self::Kill => "KILL",
        }
    }
}

impl From<JobState> for ReportedStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Stopped => Self::Kill,
            other => Self::State(other),
        }
    }
}

/// Capabilities the agent needs from an execution backend.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job, returning the backend's identifier for it.
    async fn submit(&self, submission: &Submission) -> Result<String, BackendError>;

    async fn status(&self, job_id: &str) -> Result<JobState, BackendError>;

    async fn logs(&self, job_id: &str) -> Result<String, BackendError>;

    /// Ask the backend to stop the job. Completion is observed via `status`.
    async fn stop(&self, job_id: &str) -> Result<(), BackendError>;
}
