//! In-memory object store for tests and local runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::ObjectStoreError;
use crate::storage::ObjectStore;

#[derive(Debug, Default)]
struct State {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
    gets: Vec<(String, String)>,
    created: Vec<String>,
    fail_puts: bool,
}

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: RwLock<State>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, creating its bucket.
    pub async fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state.write().await;
        state.buckets.insert(bucket.to_string());
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.read().await;
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Every `(bucket, key)` requested through `get`, oldest first.
    pub async fn gets(&self) -> Vec<(String, String)> {
        self.state.read().await.gets.clone()
    }

    /// Buckets created through `make_bucket`, oldest first.
    pub async fn buckets_created(&self) -> Vec<String> {
        self.state.read().await.created.clone()
    }

    pub async fn fail_puts(&self, fail: bool) {
        self.state.write().await.fail_puts = fail;
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        let mut state = self.state.write().await;
        state.gets.push((bucket.to_string(), key.to_string()));
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::RequestFailed {
                operation: "get",
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "no such key".to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let mut state = self.state.write().await;
        if state.fail_puts || !state.buckets.contains(bucket) {
            return Err(ObjectStoreError::RequestFailed {
                operation: "put",
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "put rejected".to_string(),
            });
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.state.read().await.buckets.contains(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let mut state = self.state.write().await;
        state.buckets.insert(bucket.to_string());
        state.created.push(bucket.to_string());
        Ok(())
    }
}
