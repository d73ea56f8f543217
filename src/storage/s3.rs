//! S3-compatible object store (MinIO, Ceph RGW, AWS).
//!
//! Credentials are read from mounted files, never from the control object,
//! so the shared status object carries only the name of the secret.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ObjectStoreError;
use crate::storage::ObjectStore;

/// S3-compatible stores ignore the region but the signer needs one.
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// `host[:port]`, or a full URL.
    pub endpoint: String,
    pub secure: bool,
    /// Directory holding the `accesskey` and `secretkey` files.
    pub credentials_dir: PathBuf,
}

impl S3Settings {
    /// Endpoint URL with the scheme implied by `secure`.
    pub fn endpoint_url(&self) -> Result<String, ObjectStoreError> {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(ObjectStoreError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
            });
        }
        if endpoint.contains("://") {
            return Ok(endpoint.to_string());
        }
        let scheme = if self.secure { "https" } else { "http" };
        Ok(format!("{scheme}://{endpoint}"))
    }
}

/// Object store client over the AWS S3 SDK.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build a client from the mounted credential files.
    pub fn connect(settings: &S3Settings) -> Result<Self, ObjectStoreError> {
        let access_key = read_credential(&settings.credentials_dir, "accesskey")?;
        let secret_key = read_credential(&settings.credentials_dir, "secretkey")?;
        let endpoint = settings.endpoint_url()?;

        let credentials = Credentials::new(
            access_key.expose_secret(),
            secret_key.expose_secret(),
            None,
            None,
            "mounted-secret",
        );
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .endpoint_url(&endpoint)
            .credentials_provider(credentials)
            // Path-style requests for custom endpoints like MinIO
            .force_path_style(true)
            .build();

        tracing::info!(endpoint = %endpoint, "Object store client created");

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
        })
    }
}

fn read_credential(dir: &Path, name: &str) -> Result<SecretString, ObjectStoreError> {
    let path = dir.join(name);
    let raw = std::fs::read_to_string(&path)
        .map_err(|source| ObjectStoreError::Credentials { path, source })?;
    Ok(SecretString::from(raw.trim().to_string()))
}

fn request_failed(
    operation: &'static str,
    bucket: &str,
    key: &str,
    err: impl std::error::Error,
) -> ObjectStoreError {
    ObjectStoreError::RequestFailed {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        reason: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_failed("get", bucket, key, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| request_failed("get", bucket, key, e))?
            .into_bytes();

        Ok(data)
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| request_failed("put", bucket, key, e))?;
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e.as_service_error().is_some_and(|se| se.is_not_found())
                    || e.raw_response().is_some_and(|r| r.status().as_u16() == 404);
                if not_found {
                    Ok(false)
                } else {
                    Err(request_failed("head_bucket", bucket, "", e))
                }
            }
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| request_failed("create_bucket", bucket, "", e))?;
        Ok(())
    }
}
