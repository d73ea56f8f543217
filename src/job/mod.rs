//! The job request: an immutable, validated view of what the control object
//! asks the agent to run.

mod submission;

pub use submission::{RuntimeEnv, ScriptMetadata, Submission, parse_string_map};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::control::{ControlSnapshot, keys};
use crate::error::{ConfigError, Error, InputError};
use crate::storage::{ObjectLocator, S3Settings};

/// Poll interval used when the control object does not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Format of every timestamp written to the control object.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Current local time in the control object's format.
pub fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Where a piece of job input lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// The payload is the content.
    Inline,
    /// The payload is a `bucket:key` locator.
    RemoteObject,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::Inline),
            // "s3" is what the pipeline orchestrator writes
            "remote-object" | "s3" => Ok(Self::RemoteObject),
            other => Err(other.to_string()),
        }
    }
}

/// A mode plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    pub field: &'static str,
    pub mode: StorageMode,
    pub payload: String,
}

impl InputSource {
    fn parse(
        snapshot: &ControlSnapshot,
        mode_key: &'static str,
        payload_key: &'static str,
    ) -> Result<Self, InputError> {
        let raw_mode = snapshot.get(mode_key).unwrap_or("");
        let mode = raw_mode
            .parse()
            .map_err(|value| InputError::UnsupportedLocation {
                field: mode_key.to_string(),
                value,
            })?;
        Ok(Self {
            field: payload_key,
            mode,
            payload: snapshot.get(payload_key).unwrap_or("").to_string(),
        })
    }
}

/// Object store settings from the control object.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub settings: S3Settings,
    /// Name of the credential secret, forwarded to the job's entrypoint.
    pub secret: Option<String>,
}

/// Destination for the job's log and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub bucket: String,
    /// Key prefix, `<job>/`.
    pub prefix: String,
    /// Requested output files; recognized but not collected by the Ray backend.
    pub files: Vec<String>,
}

impl UploadTarget {
    /// Key the execution log is uploaded to.
    pub fn log_key(&self) -> String {
        format!("{}logs", self.prefix)
    }
}

/// Everything needed to run and supervise one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_name: String,
    pub resource_url: String,
    pub resource_secret: Option<String>,
    pub script: InputSource,
    pub metadata: InputSource,
    pub parameters: InputSource,
    pub additional_data: Vec<ObjectLocator>,
    pub job_properties: BTreeMap<String, String>,
    pub object_store: Option<ObjectStoreConfig>,
    pub upload: Option<UploadTarget>,
    pub poll_interval: Duration,
    pub working_dir: PathBuf,
}

impl JobRequest {
    /// Validate the control object's contents into a request.
    pub fn from_control(snapshot: &ControlSnapshot, config: &AgentConfig) -> Result<Self, Error> {
        let poll_interval = match snapshot.get(keys::UPDATE_INTERVAL) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::InvalidValue {
                    key: keys::UPDATE_INTERVAL.to_string(),
                    message: e.to_string(),
                })?,
            None => DEFAULT_POLL_INTERVAL,
        };

        let resource_url = snapshot
            .get(keys::RESOURCE_URL)
            .map(with_default_port)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: keys::RESOURCE_URL.to_string(),
                hint: "The control object must name the execution backend".to_string(),
            })?;

        let script = InputSource::parse(snapshot, keys::SCRIPT_LOCATION, keys::JOB_SCRIPT)?;
        let metadata =
            InputSource::parse(snapshot, keys::SCRIPT_EXTRA_LOCATION, keys::SCRIPT_METADATA)?;
        let parameters =
            InputSource::parse(snapshot, keys::SCRIPT_EXTRA_LOCATION, keys::JOB_PARAMETERS)?;

        let additional_data = snapshot
            .get(keys::ADDITIONAL_DATA)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ObjectLocator::parse)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let job_properties = match snapshot.get(keys::JOB_PROPERTIES) {
            Some(raw) => parse_string_map(keys::JOB_PROPERTIES, raw)?,
            None => BTreeMap::new(),
        };

        let secret = snapshot.get(keys::S3_SECRET).map(str::to_string);
        let object_store = snapshot.get(keys::S3_ENDPOINT).map(|endpoint| ObjectStoreConfig {
            settings: S3Settings {
                endpoint: endpoint.to_string(),
                secure: snapshot.get(keys::S3_SECURE) == Some("true"),
                credentials_dir: config.s3_credentials_dir.clone(),
            },
            secret: secret.clone(),
        });

        let upload = match secret {
            Some(_) => {
                if object_store.is_none() {
                    return Err(ConfigError::MissingRequired {
                        key: keys::S3_ENDPOINT.to_string(),
                        hint: "s3.secret is set, so an object store endpoint is needed".to_string(),
                    }
                    .into());
                }
                let bucket = snapshot.get(keys::UPLOAD_BUCKET).ok_or_else(|| {
                    ConfigError::MissingRequired {
                        key: keys::UPLOAD_BUCKET.to_string(),
                        hint: "s3.secret is set, so an upload bucket is needed".to_string(),
                    }
                })?;
                Some(UploadTarget {
                    bucket: bucket.to_string(),
                    prefix: format!("{}/", config.job_name),
                    files: snapshot
                        .get(keys::UPLOAD_FILES)
                        .map(|raw| {
                            raw.split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            }
            None => None,
        };

        Ok(Self {
            job_name: config.job_name.clone(),
            resource_url,
            resource_secret: snapshot.get(keys::RESOURCE_SECRET).map(str::to_string),
            script,
            metadata,
            parameters,
            additional_data,
            job_properties,
            object_store,
            upload,
            poll_interval,
            working_dir: config.downloads_dir.clone(),
        })
    }

    /// Whether any input has to be fetched from object storage.
    pub fn needs_object_store(&self) -> bool {
        self.upload.is_some()
            || !self.additional_data.is_empty()
            || [&self.script, &self.metadata, &self.parameters]
                .iter()
                .any(|s| s.mode == StorageMode::RemoteObject)
    }
}

/// Append the scheme's default port when the address has none.
///
/// `http://host` becomes `http://host:80`, `https://host` becomes
/// `https://host:443`; an explicit port is left alone. Ray dashboards are
/// plain HTTP in practice, but an `https` address gets its own default
/// rather than a blanket `:80`.
pub fn with_default_port(address: &str) -> String {
    let address = address.trim();
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, address),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    // Skip past an IPv6 literal before looking for a port separator.
    let host_end = authority.rfind(']').map_or(0, |i| i + 1);
    if authority[host_end..].contains(':') {
        return address.to_string();
    }

    let port = match scheme {
        Some(s) if s.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    };
    match scheme {
        Some(scheme) => format!("{scheme}://{authority}:{port}{path}"),
        None => format!("{authority}:{port}{path}"),
    }
}
