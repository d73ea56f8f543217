//! End-to-end agent runs against in-memory fakes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use bridge_agent::agent;
use bridge_agent::backend::{JobBackend, JobState};
use bridge_agent::config::{AgentConfig, KUBE_REQUEST_TIMEOUT, KubeApiConfig};
use bridge_agent::control::{ControlChannel, InMemoryChannel};
use bridge_agent::error::{BackendError, ControlError, Error, InputError};
use bridge_agent::job::{JobRequest, Submission};
use bridge_agent::storage::{MemoryObjectStore, ObjectStore};
use bridge_agent::Outcome;

/// Records submissions and replays a fixed status sequence.
struct RecordingBackend {
    submissions: Mutex<Vec<Submission>>,
    statuses: Mutex<VecDeque<JobState>>,
}

impl RecordingBackend {
    fn new(statuses: &[JobState]) -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
            statuses: Mutex::new(statuses.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl JobBackend for RecordingBackend {
    async fn submit(&self, submission: &Submission) -> Result<String, BackendError> {
        self.submissions.lock().unwrap().push(submission.clone());
        Ok("raysubmit_e2e".to_string())
    }

    async fn status(&self, _job_id: &str) -> Result<JobState, BackendError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(JobState::Succeeded))
    }

    async fn logs(&self, _job_id: &str) -> Result<String, BackendError> {
        Ok("training complete\n".to_string())
    }

    async fn stop(&self, _job_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

fn config(downloads: &std::path::Path) -> AgentConfig {
    let kube = KubeApiConfig {
        api_url: "http://127.0.0.1:1".to_string(),
        token: None,
        ca_cert: None,
        timeout: KUBE_REQUEST_TIMEOUT,
    };
    let mut config = AgentConfig::new("train", "research", kube).unwrap();
    config.downloads_dir = downloads.to_path_buf();
    config
}

fn control(pairs: &[(&str, &str)]) -> Arc<InMemoryChannel> {
    Arc::new(InMemoryChannel::new(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    ))
}

async fn run(
    channel: Arc<InMemoryChannel>,
    backend: Arc<RecordingBackend>,
    store: Option<Arc<MemoryObjectStore>>,
    config: &AgentConfig,
) -> Result<Outcome, Error> {
    let snapshot = agent::load_control(channel.as_ref()).await?;
    let request = JobRequest::from_control(&snapshot, config)?;
    agent::supervise(
        channel,
        backend,
        store.map(|s| s as Arc<dyn ObjectStore>),
        snapshot,
        request,
    )
    .await
}

#[tokio::test]
async fn inline_job_without_extras_runs_to_success() {
    let downloads = tempfile::tempdir().unwrap();
    let channel = control(&[
        ("resourceURL", "http://ray-head:8265"),
        ("updateInterval", "0"),
        ("jobdata.scriptLocation", "inline"),
        ("jobdata.jobScript", "print('hello')\n"),
        ("jobdata.scriptExtraLocation", "inline"),
        ("kill", "false"),
    ]);
    let backend = RecordingBackend::new(&[JobState::Submitted, JobState::Running]);

    let outcome = run(channel.clone(), backend.clone(), None, &config(downloads.path()))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(outcome.exit_code(), 0);

    let submissions = backend.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].entrypoint, "python script.py");
    assert_eq!(
        serde_json::to_value(&submissions[0].runtime_env).unwrap(),
        serde_json::json!({ "working_dir": downloads.path().display().to_string() })
    );
    assert_eq!(
        std::fs::read_to_string(downloads.path().join("script.py")).unwrap(),
        "print('hello')\n"
    );

    assert_eq!(channel.get("id").await.as_deref(), Some("raysubmit_e2e"));
    assert_eq!(
        channel.get("status.jobStatus").await.as_deref(),
        Some("SUCCEEDED")
    );
    assert!(channel.get("status.endTime").await.is_some());
    assert_eq!(channel.get("kill").await.as_deref(), Some("false"));
}

#[tokio::test]
async fn remote_inputs_and_log_upload() {
    let downloads = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.insert("code", "train.py", "import ray\n").await;
    store
        .insert("code", "meta.json", r#"{"pip": {"numpy": "1.26.0"}, "env": {"MODE": "fast"}}"#)
        .await;
    store.insert("code", "params.json", r#"{"epochs": 3}"#).await;
    store.insert("data", "sets/train.csv", "a,b\n").await;

    let channel = control(&[
        ("resourceURL", "http://ray-head:8265"),
        ("updateInterval", "0"),
        ("jobdata.scriptLocation", "s3"),
        ("jobdata.jobScript", "code:train.py"),
        ("jobdata.scriptExtraLocation", "remote-object"),
        ("jobdata.scriptMetadata", "code:meta.json"),
        ("jobdata.jobParameters", "code:params.json"),
        ("jobdata.additionalData", "data:sets/train.csv"),
        ("jobproperties", r#"{"team": "vision"}"#),
        ("s3.endpoint", "minio:9000"),
        ("s3.secure", "false"),
        ("s3.secret", "minio-creds"),
        ("s3upload.bucket", "results"),
    ]);
    let backend = RecordingBackend::new(&[JobState::Running]);

    let outcome = run(
        channel.clone(),
        backend.clone(),
        Some(store.clone()),
        &config(downloads.path()),
    )
    .await
    .unwrap();

    assert_eq!(outcome, Outcome::Succeeded);

    let submission = backend.submissions.lock().unwrap()[0].clone();
    assert_eq!(
        submission.entrypoint,
        "python script.py --kwargs s3_secret=minio-creds, s3_bucket=results, \
         s3_prefix=train/, s3_secure=False, epochs=3"
    );
    assert_eq!(submission.runtime_env.pip, vec!["numpy==1.26.0".to_string()]);
    assert_eq!(submission.runtime_env.env_vars["MODE"], "fast");
    assert_eq!(
        submission.metadata,
        BTreeMap::from([("team".to_string(), "vision".to_string())])
    );
    assert_eq!(
        std::fs::read_to_string(downloads.path().join("train.csv")).unwrap(),
        "a,b\n"
    );

    assert_eq!(
        store.object("results", "train/logs").await.unwrap(),
        bytes::Bytes::from("training complete\n")
    );
}

#[tokio::test]
async fn unsupported_location_fails_before_submission() {
    let downloads = tempfile::tempdir().unwrap();
    let channel = control(&[
        ("resourceURL", "http://ray-head:8265"),
        ("jobdata.scriptLocation", "ftp"),
        ("jobdata.jobScript", "ftp://example/script.py"),
    ]);
    let backend = RecordingBackend::new(&[]);

    let err = run(channel.clone(), backend.clone(), None, &config(downloads.path()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Input(InputError::UnsupportedLocation { ref value, .. }) if value == "ftp"
    ));
    assert!(backend.submissions.lock().unwrap().is_empty());
    assert_eq!(channel.write_count().await, 0);
}

#[tokio::test]
async fn empty_control_object_is_fatal() {
    let channel = control(&[]);
    let err = agent::load_control(channel.as_ref()).await.unwrap_err();
    assert!(matches!(err, ControlError::Empty { .. }));
}

#[tokio::test]
async fn missing_control_object_is_fatal() {
    let channel = InMemoryChannel::missing();
    assert!(agent::load_control(&channel).await.is_err());
    assert!(channel.load().await.is_err());
}
