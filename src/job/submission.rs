//! Entrypoint and runtime environment construction.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::InputError;
use crate::job::{JobRequest, UploadTarget};

const ENTRYPOINT: &str = "python script.py";

/// Script metadata: package pins and environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub pip: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

impl ScriptMetadata {
    /// Parse the metadata JSON object; empty content means no metadata.
    pub fn parse(field: &str, content: &str) -> Result<Self, InputError> {
        let object = parse_object(field, content)?;
        let sub_map = |name: &str| -> Result<BTreeMap<String, String>, InputError> {
            match object.get(name) {
                None | Some(serde_json::Value::Null) => Ok(BTreeMap::new()),
                Some(serde_json::Value::Object(map)) => Ok(map
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_string(v)))
                    .collect()),
                Some(other) => Err(InputError::MalformedMetadata {
                    field: field.to_string(),
                    reason: format!("\"{name}\" must be an object, got {other}"),
                }),
            }
        };
        Ok(Self {
            pip: sub_map("pip")?,
            env: sub_map("env")?,
        })
    }
}

/// Parse a JSON object of scalar values into a string map.
///
/// Non-string values keep their JSON rendering (`3`, `true`). Empty content
/// is an empty map.
pub fn parse_string_map(field: &str, content: &str) -> Result<BTreeMap<String, String>, InputError> {
    Ok(parse_object(field, content)?
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect())
}

fn parse_object(
    field: &str,
    content: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, InputError> {
    if content.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    match serde_json::from_str(content) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(InputError::MalformedMetadata {
            field: field.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
        Err(e) => Err(InputError::MalformedMetadata {
            field: field.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runtime environment handed to the backend.
///
/// Absent and empty are different to the backend, so empty collections are
/// skipped rather than serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnv {
    pub working_dir: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pip: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
}

impl RuntimeEnv {
    pub fn new(working_dir: impl Into<String>, metadata: &ScriptMetadata) -> Self {
        Self {
            working_dir: working_dir.into(),
            pip: metadata
                .pip
                .iter()
                .map(|(name, version)| format!("{name}=={version}"))
                .collect(),
            env_vars: metadata.env.clone(),
        }
    }
}

/// A fully built submission: what to run and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub entrypoint: String,
    pub runtime_env: RuntimeEnv,
    /// Opaque properties recorded with the job on the backend.
    pub metadata: BTreeMap<String, String>,
}

impl Submission {
    pub fn build(
        request: &JobRequest,
        metadata: &ScriptMetadata,
        parameters: &BTreeMap<String, String>,
    ) -> Self {
        let secret = request
            .object_store
            .as_ref()
            .and_then(|store| store.secret.as_deref());
        let secure = request
            .object_store
            .as_ref()
            .is_some_and(|store| store.settings.secure);
        let upload = request.upload.as_ref().zip(secret);

        Self {
            entrypoint: build_entrypoint(upload, secure, parameters),
            runtime_env: RuntimeEnv::new(request.working_dir.display().to_string(), metadata),
            metadata: request.job_properties.clone(),
        }
    }
}

/// `python script.py`, followed by a `--kwargs` block when there is anything
/// to pass.
fn build_entrypoint(
    upload: Option<(&UploadTarget, &str)>,
    secure: bool,
    parameters: &BTreeMap<String, String>,
) -> String {
    let mut kwargs: Vec<String> = Vec::new();
    if let Some((target, secret)) = upload {
        kwargs.push(format!("s3_secret={secret}"));
        kwargs.push(format!("s3_bucket={}", target.bucket));
        kwargs.push(format!("s3_prefix={}", target.prefix));
        // The script side parses Python literals
        kwargs.push(format!("s3_secure={}", if secure { "True" } else { "False" }));
    }
    kwargs.extend(parameters.iter().map(|(k, v)| format!("{k}={v}")));

    if kwargs.is_empty() {
        ENTRYPOINT.to_string()
    } else {
        format!("{ENTRYPOINT} --kwargs {}", kwargs.join(", "))
    }
}
