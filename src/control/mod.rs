//! The control channel: the shared key/value object that carries the job
//! description in, job status out, and cancellation requests.
//!
//! The agent owns `id` and `status.*`; the external orchestrator owns `kill`.
//! Writers are not coordinated, so every write is a merge of only the keys
//! that actually changed.

mod configmap;
mod memory;

pub use configmap::ConfigMapChannel;
pub use memory::InMemoryChannel;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ControlError;

/// Flat key names used in the control object.
pub mod keys {
    pub const ID: &str = "id";
    pub const UPDATE_INTERVAL: &str = "updateInterval";
    pub const RESOURCE_URL: &str = "resourceURL";
    pub const RESOURCE_SECRET: &str = "resourcesecret";
    pub const JOB_PROPERTIES: &str = "jobproperties";
    pub const ADDITIONAL_DATA: &str = "jobdata.additionalData";
    pub const SCRIPT_METADATA: &str = "jobdata.scriptMetadata";
    pub const JOB_PARAMETERS: &str = "jobdata.jobParameters";
    pub const SCRIPT_EXTRA_LOCATION: &str = "jobdata.scriptExtraLocation";
    pub const JOB_SCRIPT: &str = "jobdata.jobScript";
    pub const SCRIPT_LOCATION: &str = "jobdata.scriptLocation";
    pub const S3_ENDPOINT: &str = "s3.endpoint";
    pub const S3_SECURE: &str = "s3.secure";
    pub const S3_SECRET: &str = "s3.secret";
    pub const UPLOAD_FILES: &str = "s3upload.files";
    pub const UPLOAD_BUCKET: &str = "s3upload.bucket";
    pub const KILL: &str = "kill";
    pub const JOB_STATUS: &str = "status.jobStatus";
    pub const MESSAGE: &str = "status.message";
    pub const START_TIME: &str = "status.startTime";
    pub const SUBMIT_TIME: &str = "status.submitTime";
    pub const END_TIME: &str = "status.endTime";
}

/// Point-in-time contents of the control object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlSnapshot {
    data: BTreeMap<String, String>,
}

impl ControlSnapshot {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// Value of `key`, treating an empty string the same as absence.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the external owner asked for the job to be cancelled.
    pub fn kill_requested(&self) -> bool {
        self.get(keys::KILL) == Some("true")
    }

    /// Keys of `updates` whose value differs from this snapshot.
    pub fn changes(&self, updates: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        updates
            .iter()
            .filter(|(key, value)| {
                self.data.get(key.as_str()).map(String::as_str).unwrap_or("") != value.as_str()
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    fn apply(&mut self, changes: BTreeMap<String, String>) {
        self.data.extend(changes);
    }
}

/// Typed access to the shared control object.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Human-readable name of the backing object, for logs and errors.
    fn name(&self) -> &str;

    /// Fetch the current contents.
    async fn load(&self) -> Result<ControlSnapshot, ControlError>;

    /// Write `changes` in a single request. Keys not present are untouched.
    async fn write(&self, changes: &BTreeMap<String, String>) -> Result<(), ControlError>;

    /// Merge `updates` into the object, relative to `snapshot`.
    ///
    /// Performs no I/O when nothing differs, otherwise exactly one write.
    /// Returns the number of keys written; on success `snapshot` reflects
    /// them.
    async fn merge(
        &self,
        snapshot: &mut ControlSnapshot,
        updates: &BTreeMap<String, String>,
    ) -> Result<usize, ControlError> {
        let changes = snapshot.changes(updates);
        if changes.is_empty() {
            return Ok(0);
        }

        for (key, value) in &changes {
            tracing::debug!(
                object = self.name(),
                key = %key,
                from = snapshot.data.get(key).map(String::as_str).unwrap_or(""),
                to = %value,
                "Updating control object"
            );
        }

        self.write(&changes).await?;
        let written = changes.len();
        snapshot.apply(changes);
        Ok(written)
    }
}
