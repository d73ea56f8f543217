//! HTTP client for the Ray job submission API.
//!
//! ```text
//! POST /api/jobs/                      submit
//! GET  /api/jobs/{id}                  status
//! GET  /api/jobs/{id}/logs             logs
//! POST /api/jobs/{id}/stop             stop
//! GET  /api/packages/gcs/{package}     package exists?
//! PUT  /api/packages/gcs/{package}     upload working_dir package
//! ```
//!
//! A local `working_dir` is zipped and uploaded as a content-addressed
//! package so the cluster can fetch it; the runtime environment then names
//! the package URI instead of the local path.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::backend::{JobBackend, JobState};
use crate::error::BackendError;
use crate::job::{RuntimeEnv, Submission};

/// Upper bound on a single dashboard request, including package uploads.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on establishing a connection to the dashboard.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for one Ray cluster's dashboard API.
pub struct RayJobClient {
    client: reqwest::Client,
    address: String,
    token: Option<SecretString>,
}

#[derive(Debug, Serialize)]
struct SubmitJobRequest<'a> {
    entrypoint: &'a str,
    runtime_env: &'a RuntimeEnv,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    #[serde(default)]
    submission_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobDetails {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobLogs {
    #[serde(default)]
    logs: String,
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    #[serde(default)]
    stopped: bool,
}

impl RayJobClient {
    pub fn new(address: &str, token: Option<SecretString>) -> Self {
        Self::with_timeout(address, token, REQUEST_TIMEOUT)
    }

    /// Create a client whose requests give up after `timeout`.
    pub fn with_timeout(address: &str, token: Option<SecretString>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .unwrap_or_default();

        Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Create a client, reading a bearer token from `<credentials_dir>/token`
    /// when the resource secret is mounted there.
    pub fn from_mounted_credentials(
        address: &str,
        resource_secret: Option<&str>,
        credentials_dir: &Path,
    ) -> Result<Self, BackendError> {
        let token_path = credentials_dir.join("token");
        let token = match resource_secret {
            Some(secret) if token_path.exists() => {
                let raw = std::fs::read_to_string(&token_path).map_err(|source| {
                    BackendError::Credentials {
                        path: token_path.clone(),
                        source,
                    }
                })?;
                tracing::debug!(secret, "Using mounted resource token");
                Some(SecretString::from(raw.trim().to_string()))
            }
            _ => None,
        };
        Ok(Self::new(address, token))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.address, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.token {
            Some(ref token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| BackendError::ConnectionFailed {
                url: self.address.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Rejected {
                operation,
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn json<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<T, BackendError> {
        resp.json().await.map_err(|e| BackendError::InvalidResponse {
            operation,
            reason: e.to_string(),
        })
    }

    /// Upload `dir` as a package unless the cluster already has it.
    ///
    /// Returns the package URI to use as `working_dir`.
    pub async fn upload_working_dir(&self, dir: &Path) -> Result<String, BackendError> {
        let owned = dir.to_path_buf();
        let package = tokio::task::spawn_blocking(move || package_dir(&owned))
            .await
            .map_err(|e| BackendError::PackagingFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })??;

        let path = format!("packages/gcs/{}", package.name);
        let uri = format!("gcs://{}", package.name);

        let exists = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| BackendError::ConnectionFailed {
                url: self.address.clone(),
                reason: e.to_string(),
            })?
            .status()
            == StatusCode::OK;

        if exists {
            tracing::info!(package = %uri, "Working directory package already on cluster");
            return Ok(uri);
        }

        let size = package.data.len();
        self.send(
            "upload package",
            self.request(reqwest::Method::PUT, &path).body(package.data),
        )
        .await?;
        tracing::info!(package = %uri, bytes = size, "Uploaded working directory package");
        Ok(uri)
    }
}

#[async_trait]
impl JobBackend for RayJobClient {
    async fn submit(&self, submission: &Submission) -> Result<String, BackendError> {
        let mut runtime_env = submission.runtime_env.clone();
        if !runtime_env.working_dir.contains("://") {
            runtime_env.working_dir = self
                .upload_working_dir(Path::new(&submission.runtime_env.working_dir))
                .await?;
        }

        let body = SubmitJobRequest {
            entrypoint: &submission.entrypoint,
            runtime_env: &runtime_env,
            metadata: (!submission.metadata.is_empty()).then_some(&submission.metadata),
        };
        tracing::info!(
            entrypoint = %submission.entrypoint,
            runtime_env = %serde_json::to_string(&runtime_env).unwrap_or_default(),
            "Submitting Ray job"
        );

        let resp = self
            .send("submit", self.request(reqwest::Method::POST, "jobs/").json(&body))
            .await?;
        let parsed: SubmitJobResponse = Self::json("submit", resp).await?;

        parsed
            .submission_id
            .or(parsed.job_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BackendError::InvalidResponse {
                operation: "submit",
                reason: "response carried no job identifier".to_string(),
            })
    }

    async fn status(&self, job_id: &str) -> Result<JobState, BackendError> {
        let resp = self
            .send(
                "status",
                self.request(reqwest::Method::GET, &format!("jobs/{job_id}")),
            )
            .await?;
        let details: JobDetails = Self::json("status", resp).await?;
        if let Some(ref message) = details.message {
            tracing::debug!(job_id, status = %details.status, message = %message, "Ray job details");
        }
        parse_job_status(&details.status)
    }

    async fn logs(&self, job_id: &str) -> Result<String, BackendError> {
        let resp = self
            .send(
                "logs",
                self.request(reqwest::Method::GET, &format!("jobs/{job_id}/logs")),
            )
            .await?;
        let logs: JobLogs = Self::json("logs", resp).await?;
        Ok(logs.logs)
    }

    async fn stop(&self, job_id: &str) -> Result<(), BackendError> {
        let resp = self
            .send(
                "stop",
                self.request(reqwest::Method::POST, &format!("jobs/{job_id}/stop")),
            )
            .await?;
        let stop: StopResponse = Self::json("stop", resp).await?;
        if !stop.stopped {
            tracing::info!(job_id, "Ray reports the job was not running");
        }
        Ok(())
    }
}

fn parse_job_status(s: &str) -> Result<JobState, BackendError> {
    match s {
        "PENDING" => Ok(JobState::Submitted),
        "RUNNING" => Ok(JobState::Running),
        "SUCCEEDED" => Ok(JobState::Succeeded),
        "FAILED" => Ok(JobState::Failed),
        "STOPPED" => Ok(JobState::Stopped),
        other => Err(BackendError::UnknownStatus(other.to_string())),
    }
}

/// A zipped working directory and its content-addressed name.
struct Package {
    name: String,
    data: Vec<u8>,
}

fn package_dir(dir: &Path) -> Result<Package, BackendError> {
    let failed = |reason: String| BackendError::PackagingFailed {
        path: dir.to_path_buf(),
        reason,
    };

    if !dir.is_dir() {
        return Err(failed("not a directory".to_string()));
    }
    let mut files = collect_files(dir);
    files.sort();

    let mut hasher = Sha256::new();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));

    for (name, path) in &files {
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let content = std::fs::read(path).map_err(|e| failed(e.to_string()))?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&content);

        writer
            .start_file(name.as_str(), options)
            .map_err(|e| failed(e.to_string()))?;
        writer.write_all(&content).map_err(|e| failed(e.to_string()))?;
    }

    let data = writer
        .finish()
        .map_err(|e| failed(e.to_string()))?
        .into_inner();
    let digest = hex::encode(hasher.finalize());

    Ok(Package {
        name: format!("_ray_pkg_{}.zip", &digest[..32]),
        data,
    })
}

/// Regular files under `dir`, as (archive name, path) pairs.
///
/// Symlinks are followed, so projected volume files are packaged by content.
/// Unreadable entries are skipped with a warning.
fn collect_files(dir: &Path) -> Vec<(String, PathBuf)> {
    WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Skipping unreadable path entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let path = entry.into_path();
            let name = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            (name, path)
        })
        .collect()
}
