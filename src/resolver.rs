//! Resolves job inputs to local content and stages them for submission.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::InputError;
use crate::job::{InputSource, JobRequest, ScriptMetadata, StorageMode, parse_string_map};
use crate::storage::{ObjectLocator, ObjectStore};

/// File name the script is staged under, relative to the working directory.
pub const SCRIPT_FILE: &str = "script.py";

/// Inputs after resolution.
#[derive(Debug, Clone)]
pub struct StagedInputs {
    pub script_path: PathBuf,
    pub metadata: ScriptMetadata,
    pub parameters: BTreeMap<String, String>,
}

/// Fetches inline or object-store content.
pub struct InputResolver<'a> {
    store: Option<&'a dyn ObjectStore>,
}

impl<'a> InputResolver<'a> {
    pub fn new(store: Option<&'a dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Content of `source`: the payload itself, or the referenced object.
    pub async fn fetch(&self, source: &InputSource) -> Result<String, InputError> {
        match source.mode {
            StorageMode::Inline => Ok(source.payload.clone()),
            StorageMode::RemoteObject => {
                let locator = ObjectLocator::parse(&source.payload)?;
                let data = self.fetch_object(source.field, &locator).await?;
                String::from_utf8(data.to_vec()).map_err(|e| InputError::FetchFailed {
                    bucket: locator.bucket.clone(),
                    key: locator.key.clone(),
                    reason: format!("content is not UTF-8: {e}"),
                })
            }
        }
    }

    async fn fetch_object(
        &self,
        field: &str,
        locator: &ObjectLocator,
    ) -> Result<bytes::Bytes, InputError> {
        let store = self.store.ok_or_else(|| InputError::ObjectStoreRequired {
            field: field.to_string(),
        })?;
        tracing::debug!(object = %locator, "Fetching from object store");
        store
            .get(&locator.bucket, &locator.key)
            .await
            .map_err(|e| InputError::FetchFailed {
                bucket: locator.bucket.clone(),
                key: locator.key.clone(),
                reason: e.to_string(),
            })
    }

    /// Resolve every input of `request` and stage files into its working
    /// directory.
    pub async fn stage(&self, request: &JobRequest) -> Result<StagedInputs, InputError> {
        let dir = &request.working_dir;
        create_dir(dir).await?;

        let script = self.fetch(&request.script).await?;
        let script_path = dir.join(SCRIPT_FILE);
        write_file(&script_path, script.as_bytes()).await?;
        tracing::info!(path = %script_path.display(), bytes = script.len(), "Staged job script");

        let metadata = ScriptMetadata::parse(
            request.metadata.field,
            &self.fetch(&request.metadata).await?,
        )?;
        let parameters = parse_string_map(
            request.parameters.field,
            &self.fetch(&request.parameters).await?,
        )?;

        for locator in &request.additional_data {
            let data = self
                .fetch_object(crate::control::keys::ADDITIONAL_DATA, locator)
                .await?;
            let path = dir.join(locator.file_name());
            write_file(&path, &data).await?;
            tracing::info!(object = %locator, path = %path.display(), "Staged additional data");
        }

        Ok(StagedInputs {
            script_path,
            metadata,
            parameters,
        })
    }
}

async fn create_dir(dir: &Path) -> Result<(), InputError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| InputError::StageFailed {
            path: dir.to_path_buf(),
            source,
        })
}

async fn write_file(path: &Path, data: &[u8]) -> Result<(), InputError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|source| InputError::StageFailed {
            path: path.to_path_buf(),
            source,
        })
}
