//! Object storage used for staged inputs and terminal log upload.

mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::{S3ObjectStore, S3Settings};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{InputError, ObjectStoreError};

/// Bucket/key object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError>;

    async fn make_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError>;

    /// Create `bucket` unless it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        if !self.bucket_exists(bucket).await? {
            tracing::info!(bucket, "Creating bucket");
            self.make_bucket(bucket).await?;
        }
        Ok(())
    }
}

/// A `bucket:key` reference to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    /// Parse `bucket:key`, splitting on the first colon.
    pub fn parse(value: &str) -> Result<Self, InputError> {
        let malformed = || InputError::MalformedLocator {
            value: value.to_string(),
        };
        let (bucket, key) = value.trim().split_once(':').ok_or_else(malformed)?;
        if bucket.is_empty() || key.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.key)
    }
}
