//! Job lifecycle controller.
//!
//! Submits the job (or resumes one the control object already names), then
//! polls the backend until it reaches a terminal state, relaying status
//! through the control channel and honoring the `kill` flag.
//!
//! ```text
//! NOT_SUBMITTED ──submit──► SUBMITTED/RUNNING ──poll──► SUCCEEDED | FAILED | STOPPED
//!        │                        ▲     │                               (reported as KILL)
//!        └──── id present ────────┘     └── kill == "true" → stop()
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{JobBackend, JobState, ReportedStatus};
use crate::control::{ControlChannel, ControlSnapshot, keys};
use crate::job::{JobRequest, Submission, UploadTarget, timestamp};
use crate::storage::ObjectStore;

/// Written to `status.message` when the backend refuses the job.
pub const SUBMISSION_FAILED: &str = "submission failed";

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Stopped,
    SubmissionFailed,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed | Self::Stopped | Self::SubmissionFailed => 1,
        }
    }
}

/// Drives one job from submission to a terminal state.
pub struct JobSupervisor {
    channel: Arc<dyn ControlChannel>,
    backend: Arc<dyn JobBackend>,
    store: Option<Arc<dyn ObjectStore>>,
    job_name: String,
    poll_interval: Duration,
    upload: Option<UploadTarget>,
}

impl JobSupervisor {
    pub fn new(
        channel: Arc<dyn ControlChannel>,
        backend: Arc<dyn JobBackend>,
        request: &JobRequest,
    ) -> Self {
        Self {
            channel,
            backend,
            store: None,
            job_name: request.job_name.clone(),
            poll_interval: request.poll_interval,
            upload: request.upload.clone(),
        }
    }

    /// Object store used to deliver the execution log.
    pub fn with_object_store(mut self, store: Option<Arc<dyn ObjectStore>>) -> Self {
        self.store = store;
        self
    }

    /// Submit or resume, then supervise to completion.
    ///
    /// `snapshot` is the control object as loaded at startup.
    pub async fn run(&self, mut snapshot: ControlSnapshot, submission: &Submission) -> Outcome {
        let mut current = BTreeMap::new();

        let job_id = match snapshot.get(keys::ID) {
            Some(id) => {
                tracing::info!(job = %self.job_name, id, "Resuming supervision of existing job");
                id.to_string()
            }
            None => match self.submit(&mut snapshot, submission, &mut current).await {
                Some(id) => id,
                None => return Outcome::SubmissionFailed,
            },
        };
        current.insert(keys::ID.to_string(), job_id.clone());

        self.monitor(&job_id, snapshot, current).await
    }

    async fn submit(
        &self,
        snapshot: &mut ControlSnapshot,
        submission: &Submission,
        current: &mut BTreeMap<String, String>,
    ) -> Option<String> {
        tracing::info!(job = %self.job_name, "Submitting new job");

        match self.backend.submit(submission).await {
            Ok(id) => {
                let now = timestamp();
                current.insert(keys::ID.to_string(), id.clone());
                current.insert(
                    keys::JOB_STATUS.to_string(),
                    JobState::Submitted.as_str().to_string(),
                );
                current.insert(keys::START_TIME.to_string(), now.clone());
                current.insert(keys::SUBMIT_TIME.to_string(), now);
                self.flush(snapshot, current).await;
                tracing::info!(job = %self.job_name, id = %id, "Job submitted");
                Some(id)
            }
            Err(e) => {
                tracing::error!(job = %self.job_name, "Failed to submit job: {}", e);
                current.insert(
                    keys::JOB_STATUS.to_string(),
                    JobState::Failed.as_str().to_string(),
                );
                current.insert(keys::MESSAGE.to_string(), SUBMISSION_FAILED.to_string());
                self.flush(snapshot, current).await;
                None
            }
        }
    }

    async fn monitor(
        &self,
        job_id: &str,
        mut snapshot: ControlSnapshot,
        mut current: BTreeMap<String, String>,
    ) -> Outcome {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.channel.load().await {
                Ok(fresh) => snapshot = fresh,
                Err(e) => {
                    tracing::warn!(job = %self.job_name, "Failed to reload control object: {}", e);
                }
            }

            let state = match self.backend.status(job_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(job = %self.job_name, id = job_id, "Failed to get job status, failing the job: {}", e);
                    JobState::Failed
                }
            };
            tracing::info!(job = %self.job_name, id = job_id, status = %state, "Polled job");

            current.insert(
                keys::JOB_STATUS.to_string(),
                ReportedStatus::from(state).as_str().to_string(),
            );

            if state.is_terminal() {
                current.insert(keys::END_TIME.to_string(), timestamp());
                let message = match self.upload {
                    Some(ref target) => self.upload_log(job_id, target).await,
                    None => {
                        "Output, intermediate results and log can be found at the location \
                         configured for the job"
                            .to_string()
                    }
                };
                current.insert(keys::MESSAGE.to_string(), message);
            } else if snapshot.kill_requested() {
                tracing::info!(job = %self.job_name, id = job_id, "Kill requested, stopping job");
                if let Err(e) = self.backend.stop(job_id).await {
                    tracing::warn!(job = %self.job_name, id = job_id, "Failed to stop job: {}", e);
                }
            }

            self.flush(&mut snapshot, &current).await;

            match state {
                JobState::Succeeded => return Outcome::Succeeded,
                JobState::Failed => return Outcome::Failed,
                JobState::Stopped => return Outcome::Stopped,
                JobState::Submitted | JobState::Running => {}
            }
        }
    }

    /// Deliver the execution log. Returns the status message describing the
    /// result; never changes the job's outcome.
    async fn upload_log(&self, job_id: &str, target: &UploadTarget) -> String {
        let logs = match self.backend.logs(job_id).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(job = %self.job_name, id = job_id, "Failed to fetch job log: {}", e);
                return format!("Failed to fetch execution log: {e}");
            }
        };
        if logs.is_empty() {
            tracing::info!(job = %self.job_name, id = job_id, "Job log is empty");
            return "Execution log is empty".to_string();
        }

        let Some(ref store) = self.store else {
            return "Failed to upload execution log: no object store".to_string();
        };
        let key = target.log_key();
        let result = async {
            store.ensure_bucket(&target.bucket).await?;
            store
                .put(&target.bucket, &key, bytes::Bytes::from(logs))
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(job = %self.job_name, bucket = %target.bucket, key = %key, "Uploaded job log");
                format!("Execution log uploaded to {}:{}", target.bucket, key)
            }
            Err(e) => {
                tracing::warn!(job = %self.job_name, "Failed to upload job log: {}", e);
                format!("Failed to upload execution log: {e}")
            }
        }
    }

    async fn flush(&self, snapshot: &mut ControlSnapshot, current: &BTreeMap<String, String>) {
        if let Err(e) = self.channel.merge(snapshot, current).await {
            tracing::warn!(job = %self.job_name, "Failed to update control object: {}", e);
        }
    }
}
