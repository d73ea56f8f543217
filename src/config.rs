//! Configuration for the bridge agent.
//!
//! The pod scheduler identifies the job through `JOBNAME` and `NAMESPACE` and
//! mounts credentials as files. Everything else about the job lives in the
//! control object, not here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Suffix appended to the job name to form the control object name.
pub const CONTROL_OBJECT_SUFFIX: &str = "-bridge-cm";
/// Directory the job script and additional data are staged into.
pub const DEFAULT_DOWNLOADS_DIR: &str = "/downloads";
/// Mount point of the object store access/secret key files.
pub const DEFAULT_S3_CREDENTIALS_DIR: &str = "/s3credentials";
/// Mount point of the execution backend credentials.
pub const DEFAULT_CREDENTIALS_DIR: &str = "/credentials";
/// Standard in-cluster service account mount.
pub const DEFAULT_SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
/// Upper bound on a single Kubernetes API request.
pub const KUBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on connecting to the Kubernetes API server.
pub const KUBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub job_name: String,
    pub namespace: String,
    pub kube: KubeApiConfig,
    pub downloads_dir: PathBuf,
    pub s3_credentials_dir: PathBuf,
    pub credentials_dir: PathBuf,
}

impl AgentConfig {
    /// Build a configuration with the default mount locations.
    pub fn new(
        job_name: impl Into<String>,
        namespace: impl Into<String>,
        kube: KubeApiConfig,
    ) -> Result<Self, ConfigError> {
        let job_name = job_name.into();
        let namespace = namespace.into();

        if job_name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "JOBNAME".to_string(),
                hint: "The scheduler must set the job name in the environment".to_string(),
            });
        }
        if namespace.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "NAMESPACE".to_string(),
                hint: "The scheduler must set the namespace in the environment".to_string(),
            });
        }

        Ok(Self {
            job_name,
            namespace,
            kube,
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            s3_credentials_dir: PathBuf::from(DEFAULT_S3_CREDENTIALS_DIR),
            credentials_dir: PathBuf::from(DEFAULT_CREDENTIALS_DIR),
        })
    }

    /// Name of the control object for this job.
    pub fn control_object_name(&self) -> String {
        format!("{}{}", self.job_name, CONTROL_OBJECT_SUFFIX)
    }
}

/// How to reach the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeApiConfig {
    /// Base URL, e.g. `https://10.0.0.1:443`.
    pub api_url: String,
    pub token: Option<SecretString>,
    /// PEM bundle used to verify the API server.
    pub ca_cert: Option<PathBuf>,
    /// Per-request timeout for control object reads and writes.
    pub timeout: Duration,
}

impl KubeApiConfig {
    /// Resolve the API server location.
    ///
    /// An explicit URL wins; otherwise the in-cluster service environment
    /// (`KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT`) is used. The
    /// token and CA bundle are picked up from the service account directory
    /// when present.
    pub fn resolve(
        explicit_url: Option<String>,
        service_account_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let api_url = match explicit_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => in_cluster_url()?,
        };

        let token_path = service_account_dir.join("token");
        let token = if token_path.exists() {
            let raw = std::fs::read_to_string(&token_path)?;
            Some(SecretString::from(raw.trim().to_string()))
        } else {
            None
        };

        let ca_path = service_account_dir.join("ca.crt");
        let ca_cert = ca_path.exists().then_some(ca_path);

        Ok(Self {
            api_url,
            token,
            ca_cert,
            timeout: KUBE_REQUEST_TIMEOUT,
        })
    }
}

fn in_cluster_url() -> Result<String, ConfigError> {
    let host = optional_env("KUBERNETES_SERVICE_HOST")?.ok_or_else(|| {
        ConfigError::MissingRequired {
            key: "KUBERNETES_SERVICE_HOST".to_string(),
            hint: "Run inside a pod or pass --kube-api-url".to_string(),
        }
    })?;
    let port: u16 = parse_optional_env("KUBERNETES_SERVICE_PORT", 443)?;

    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use secrecy::ExposeSecret;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn explicit_kube() -> KubeApiConfig {
        KubeApiConfig {
            api_url: "http://127.0.0.1:8001".to_string(),
            token: None,
            ca_cert: None,
            timeout: KUBE_REQUEST_TIMEOUT,
        }
    }

    #[test]
    fn control_object_name_appends_suffix() {
        let config = AgentConfig::new("train-42", "jobs", explicit_kube()).unwrap();
        assert_eq!(config.control_object_name(), "train-42-bridge-cm");
        assert_eq!(config.downloads_dir, PathBuf::from("/downloads"));
    }

    #[test]
    fn empty_job_name_is_rejected() {
        let err = AgentConfig::new(" ", "jobs", explicit_kube()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "JOBNAME"));
    }

    #[test]
    fn empty_namespace_is_rejected() {
        let err = AgentConfig::new("job", "", explicit_kube()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "NAMESPACE"));
    }

    #[test]
    fn explicit_url_reads_service_account_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "abc123\n").unwrap();
        std::fs::write(dir.path().join("ca.crt"), "pem").unwrap();

        let kube =
            KubeApiConfig::resolve(Some("http://localhost:8001/".to_string()), dir.path()).unwrap();

        assert_eq!(kube.api_url, "http://localhost:8001");
        assert_eq!(kube.token.unwrap().expose_secret(), "abc123");
        assert_eq!(kube.ca_cert, Some(dir.path().join("ca.crt")));
    }

    #[test]
    fn in_cluster_url_from_service_env() {
        let _lock = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("KUBERNETES_SERVICE_HOST", "10.96.0.1");
            std::env::set_var("KUBERNETES_SERVICE_PORT", "6443");
        }

        let kube = KubeApiConfig::resolve(None, dir.path()).unwrap();
        assert_eq!(kube.api_url, "https://10.96.0.1:6443");
        assert!(kube.token.is_none());
        assert!(kube.ca_cert.is_none());

        unsafe {
            std::env::remove_var("KUBERNETES_SERVICE_HOST");
            std::env::remove_var("KUBERNETES_SERVICE_PORT");
        }
    }

    #[test]
    fn in_cluster_url_requires_service_host() {
        let _lock = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::remove_var("KUBERNETES_SERVICE_HOST") };

        let err = KubeApiConfig::resolve(None, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn optional_env_returns_none_for_empty_string() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_BRIDGE_EMPTY_42", "") };
        let result = optional_env("_TEST_BRIDGE_EMPTY_42").unwrap();
        assert!(result.is_none());
        unsafe { std::env::remove_var("_TEST_BRIDGE_EMPTY_42") };
    }

    #[test]
    fn parse_optional_env_errors_on_invalid() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_BRIDGE_PARSE_BAD_42", "not_a_number") };
        let result: Result<u16, _> = parse_optional_env("_TEST_BRIDGE_PARSE_BAD_42", 0);
        assert!(result.is_err());
        unsafe { std::env::remove_var("_TEST_BRIDGE_PARSE_BAD_42") };
    }
}
