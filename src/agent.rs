//! Agent startup: wires the control channel, object store and backend
//! together and hands the job to the supervisor.

use std::sync::Arc;

use crate::backend::{JobBackend, RayJobClient};
use crate::config::AgentConfig;
use crate::control::{ConfigMapChannel, ControlChannel, ControlSnapshot};
use crate::error::{ControlError, Error};
use crate::job::{JobRequest, Submission};
use crate::resolver::InputResolver;
use crate::storage::{ObjectStore, S3ObjectStore};
use crate::supervisor::{JobSupervisor, Outcome};

/// Run the agent against the in-cluster control object and Ray backend.
pub async fn run(config: &AgentConfig) -> Result<Outcome, Error> {
    let channel = ConfigMapChannel::from_config(
        &config.kube,
        &config.namespace,
        &config.control_object_name(),
    )?;
    let snapshot = load_control(&channel).await?;
    let request = JobRequest::from_control(&snapshot, config)?;

    let store = connect_object_store(&request)?;
    let backend = RayJobClient::from_mounted_credentials(
        &request.resource_url,
        request.resource_secret.as_deref(),
        &config.credentials_dir,
    )?;

    supervise(Arc::new(channel), Arc::new(backend), store, snapshot, request).await
}

/// Load the control object; an empty one carries no job and is fatal.
pub async fn load_control(channel: &dyn ControlChannel) -> Result<ControlSnapshot, ControlError> {
    let snapshot = channel.load().await?;
    if snapshot.is_empty() {
        return Err(ControlError::Empty {
            name: channel.name().to_string(),
        });
    }
    Ok(snapshot)
}

/// Connect to the object store described by the request.
///
/// Required when an upload destination is configured. Otherwise a failure
/// only matters if a remote input needs the store, which the resolver
/// reports on its own.
fn connect_object_store(request: &JobRequest) -> Result<Option<Arc<dyn ObjectStore>>, Error> {
    let Some(ref store_config) = request.object_store else {
        return Ok(None);
    };

    match S3ObjectStore::connect(&store_config.settings) {
        Ok(store) => Ok(Some(Arc::new(store))),
        Err(e) if request.upload.is_some() => Err(e.into()),
        Err(e) => {
            if request.needs_object_store() {
                tracing::warn!(job = %request.job_name, "Object store unavailable: {}", e);
            } else {
                tracing::debug!(job = %request.job_name, "Object store not configured: {}", e);
            }
            Ok(None)
        }
    }
}

/// Stage the job's inputs, build the submission and supervise the job to
/// completion.
pub async fn supervise(
    channel: Arc<dyn ControlChannel>,
    backend: Arc<dyn JobBackend>,
    store: Option<Arc<dyn ObjectStore>>,
    snapshot: ControlSnapshot,
    request: JobRequest,
) -> Result<Outcome, Error> {
    let staged = InputResolver::new(store.as_deref())
        .stage(&request)
        .await?;
    let submission = Submission::build(&request, &staged.metadata, &staged.parameters);
    tracing::debug!(job = %request.job_name, entrypoint = %submission.entrypoint, "Built submission");

    let supervisor = JobSupervisor::new(channel, backend, &request).with_object_store(store);
    Ok(supervisor.run(snapshot, &submission).await)
}
