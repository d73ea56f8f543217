//! In-memory control channel.
//!
//! Stands in for the Kubernetes object in tests and local runs. It records
//! every write so callers can assert on the exact sequence of merges, and
//! `set` plays the part of the external owner flipping `kill`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::control::{ControlChannel, ControlSnapshot};
use crate::error::ControlError;

const NAME: &str = "in-memory";

#[derive(Debug, Default)]
struct State {
    data: Option<BTreeMap<String, String>>,
    writes: Vec<BTreeMap<String, String>>,
    fail_writes: bool,
    fail_loads: bool,
}

/// Control channel backed by a map in process memory.
#[derive(Debug, Default)]
pub struct InMemoryChannel {
    state: RwLock<State>,
}

impl InMemoryChannel {
    pub fn new(data: BTreeMap<String, String>) -> Self {
        Self {
            state: RwLock::new(State {
                data: Some(data),
                ..Default::default()
            }),
        }
    }

    /// A channel whose backing object does not exist.
    pub fn missing() -> Self {
        Self::default()
    }

    /// Set a key as an external writer would.
    pub async fn set(&self, key: &str, value: &str) {
        let mut state = self.state.write().await;
        state
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let state = self.state.read().await;
        state.data.as_ref().and_then(|d| d.get(key).cloned())
    }

    /// Make subsequent writes fail until switched back.
    pub async fn fail_writes(&self, fail: bool) {
        self.state.write().await.fail_writes = fail;
    }

    /// Make subsequent loads fail as an unreachable API server would.
    pub async fn fail_loads(&self, fail: bool) {
        self.state.write().await.fail_loads = fail;
    }

    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes.len()
    }

    /// Every successful write, oldest first.
    pub async fn writes(&self) -> Vec<BTreeMap<String, String>> {
        self.state.read().await.writes.clone()
    }
}

#[async_trait]
impl ControlChannel for InMemoryChannel {
    fn name(&self) -> &str {
        NAME
    }

    async fn load(&self) -> Result<ControlSnapshot, ControlError> {
        let state = self.state.read().await;
        if state.fail_loads {
            return Err(ControlError::Unavailable {
                name: NAME.to_string(),
                reason: "loads disabled".to_string(),
            });
        }
        state
            .data
            .clone()
            .map(ControlSnapshot::new)
            .ok_or_else(|| ControlError::NotFound {
                name: NAME.to_string(),
            })
    }

    async fn write(&self, changes: &BTreeMap<String, String>) -> Result<(), ControlError> {
        let mut state = self.state.write().await;
        if state.fail_writes {
            return Err(ControlError::WriteFailed {
                name: NAME.to_string(),
                reason: "writes disabled".to_string(),
            });
        }
        let Some(data) = state.data.as_mut() else {
            return Err(ControlError::NotFound {
                name: NAME.to_string(),
            });
        };
        data.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.writes.push(changes.clone());
        Ok(())
    }
}
