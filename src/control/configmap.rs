//! Control channel backed by a Kubernetes ConfigMap.
//!
//! Talks to the API server directly over HTTPS with the pod's service
//! account token. Writes are JSON merge patches of the `data` field, so keys
//! owned by other writers are never overwritten.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::{KUBE_CONNECT_TIMEOUT, KubeApiConfig};
use crate::control::{ControlChannel, ControlSnapshot};
use crate::error::{ConfigError, ControlError};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// HTTP client for one ConfigMap.
pub struct ConfigMapChannel {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    name: String,
    token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct ConfigMapBody {
    #[serde(default)]
    data: Option<BTreeMap<String, String>>,
}

impl ConfigMapChannel {
    /// Create a channel for `namespace/name` using the resolved API settings.
    pub fn from_config(
        kube: &KubeApiConfig,
        namespace: &str,
        name: &str,
    ) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(kube.timeout)
            .connect_timeout(KUBE_CONNECT_TIMEOUT.min(kube.timeout));
        if let Some(ref ca_path) = kube.ca_cert {
            let pem = std::fs::read(ca_path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::InvalidValue {
                    key: ca_path.display().to_string(),
                    message: e.to_string(),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigError::ParseError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(
            client,
            kube.api_url.clone(),
            namespace,
            name,
            kube.token.clone(),
        ))
    }

    /// Create with an explicit client (for testing).
    pub fn with_client(
        client: reqwest::Client,
        api_url: String,
        namespace: &str,
        name: &str,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            token,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/configmaps/{}",
            self.api_url, self.namespace, self.name
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> ControlError {
        ControlError::Unavailable {
            name: self.qualified_name(),
            reason: reason.into(),
        }
    }

    fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[async_trait]
impl ControlChannel for ConfigMapChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<ControlSnapshot, ControlError> {
        let resp = self
            .authorize(self.client.get(self.url()))
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ControlError::NotFound {
                name: self.qualified_name(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("GET returned {status}: {body}")));
        }

        let body: ConfigMapBody = resp
            .json()
            .await
            .map_err(|e| self.unavailable(format!("failed to parse ConfigMap: {e}")))?;

        Ok(ControlSnapshot::new(body.data.unwrap_or_default()))
    }

    async fn write(&self, changes: &BTreeMap<String, String>) -> Result<(), ControlError> {
        let patch = serde_json::json!({ "data": changes });
        let body = serde_json::to_vec(&patch).map_err(|e| ControlError::WriteFailed {
            name: self.qualified_name(),
            reason: e.to_string(),
        })?;

        let resp = self
            .authorize(self.client.patch(self.url()))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body)
            .send()
            .await
            .map_err(|e| ControlError::WriteFailed {
                name: self.qualified_name(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlError::WriteFailed {
                name: self.qualified_name(),
                reason: format!("PATCH returned {status}: {body}"),
            });
        }

        tracing::info!(object = %self.qualified_name(), keys = changes.len(), "ConfigMap updated");
        Ok(())
    }
}
