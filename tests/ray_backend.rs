//! Integration tests for `RayJobClient` against a mock Ray dashboard API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use bridge_agent::backend::{JobBackend, JobState, RayJobClient};
use bridge_agent::error::BackendError;
use bridge_agent::job::{RuntimeEnv, ScriptMetadata, Submission};

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MockState {
    submissions: Arc<Mutex<Vec<Value>>>,
    packages: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    package_puts: Arc<Mutex<usize>>,
    status: Arc<Mutex<String>>,
    stops: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Vec<String>>>,
    reject_submit: bool,
}

fn record_auth(state: &MockState, headers: &HeaderMap) {
    if let Some(value) = headers.get("authorization") {
        state
            .auth
            .lock()
            .unwrap()
            .push(value.to_str().unwrap().to_string());
    }
}

async fn submit_job(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record_auth(&state, &headers);
    if state.reject_submit {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "runtime_env invalid" })),
        );
    }
    state.submissions.lock().unwrap().push(body);
    (
        StatusCode::OK,
        Json(json!({ "job_id": "raysubmit_abc", "submission_id": "raysubmit_abc" })),
    )
}

async fn job_status(State(state): State<MockState>, Path(id): Path<String>) -> Json<Value> {
    let status = state.status.lock().unwrap().clone();
    Json(json!({ "submission_id": id, "status": status, "message": "Job is running." }))
}

async fn job_logs(Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "logs": format!("{id}: epoch 1\n{id}: done\n") }))
}

async fn stop_job(State(state): State<MockState>, Path(id): Path<String>) -> Json<Value> {
    state.stops.lock().unwrap().push(id);
    Json(json!({ "stopped": true }))
}

async fn get_package(State(state): State<MockState>, Path(name): Path<String>) -> StatusCode {
    if state.packages.lock().unwrap().contains_key(&name) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_package(
    State(state): State<MockState>,
    Path(name): Path<String>,
    body: Bytes,
) -> StatusCode {
    *state.package_puts.lock().unwrap() += 1;
    state.packages.lock().unwrap().insert(name, body.to_vec());
    StatusCode::OK
}

fn mock_router(state: MockState) -> Router {
    Router::new()
        .route("/api/jobs/", post(submit_job))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/logs", get(job_logs))
        .route("/api/jobs/{id}/stop", post(stop_job))
        .route("/api/packages/gcs/{name}", get(get_package).put(put_package))
        .with_state(state)
}

async fn start_mock_server(state: MockState) -> String {
    start_server(mock_router(state)).await
}

async fn start_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{}", addr);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    base_url
}

fn submission(working_dir: &std::path::Path, metadata: BTreeMap<String, String>) -> Submission {
    Submission {
        entrypoint: "python script.py".to_string(),
        runtime_env: RuntimeEnv::new(working_dir.display().to_string(), &ScriptMetadata::default()),
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_submit_uploads_working_dir_once() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("script.py"), "print('hi')\n").unwrap();

    let client = RayJobClient::new(&base_url, None);
    let id = client
        .submit(&submission(dir.path(), BTreeMap::new()))
        .await
        .unwrap();
    assert_eq!(id, "raysubmit_abc");

    // Same content, same package: no second upload.
    client
        .submit(&submission(dir.path(), BTreeMap::new()))
        .await
        .unwrap();
    assert_eq!(*state.package_puts.lock().unwrap(), 1);

    let submissions = state.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 2);
    let working_dir = submissions[0]["runtime_env"]["working_dir"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(working_dir.starts_with("gcs://_ray_pkg_"), "{working_dir}");
    assert!(working_dir.ends_with(".zip"));
    assert_eq!(submissions[0]["entrypoint"], "python script.py");
    assert_eq!(submissions[0]["runtime_env"].as_object().unwrap().len(), 1);
    assert!(submissions[0].get("metadata").is_none());

    let name = working_dir.trim_start_matches("gcs://");
    assert!(state.packages.lock().unwrap().contains_key(name));
}

#[tokio::test]
async fn test_submit_forwards_job_properties_as_metadata() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("script.py"), "pass\n").unwrap();

    let properties = BTreeMap::from([("team".to_string(), "vision".to_string())]);
    RayJobClient::new(&base_url, None)
        .submit(&submission(dir.path(), properties))
        .await
        .unwrap();

    let submissions = state.submissions.lock().unwrap().clone();
    assert_eq!(submissions[0]["metadata"], json!({ "team": "vision" }));
}

#[tokio::test]
async fn test_rejected_submission_is_an_error() {
    let state = MockState {
        reject_submit: true,
        ..Default::default()
    };
    let base_url = start_mock_server(state).await;

    let result = RayJobClient::new(&base_url, None)
        .submit(&Submission {
            entrypoint: "python script.py".to_string(),
            runtime_env: RuntimeEnv::new("gcs://_ray_pkg_cached.zip", &ScriptMetadata::default()),
            metadata: BTreeMap::new(),
        })
        .await;

    match result {
        Err(BackendError::Rejected { status, body, .. }) => {
            assert_eq!(status, 400);
            assert!(body.contains("runtime_env invalid"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_mapping() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let client = RayJobClient::new(&base_url, None);

    for (raw, expected) in [
        ("PENDING", JobState::Submitted),
        ("RUNNING", JobState::Running),
        ("SUCCEEDED", JobState::Succeeded),
        ("FAILED", JobState::Failed),
        ("STOPPED", JobState::Stopped),
    ] {
        *state.status.lock().unwrap() = raw.to_string();
        assert_eq!(client.status("raysubmit_abc").await.unwrap(), expected, "{raw}");
    }

    *state.status.lock().unwrap() = "EXPLODED".to_string();
    assert!(matches!(
        client.status("raysubmit_abc").await,
        Err(BackendError::UnknownStatus(s)) if s == "EXPLODED"
    ));
}

#[tokio::test]
async fn test_logs_and_stop() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let client = RayJobClient::new(&base_url, None);

    let logs = client.logs("raysubmit_abc").await.unwrap();
    assert_eq!(logs, "raysubmit_abc: epoch 1\nraysubmit_abc: done\n");

    client.stop("raysubmit_abc").await.unwrap();
    assert_eq!(*state.stops.lock().unwrap(), vec!["raysubmit_abc".to_string()]);
}

#[tokio::test]
async fn test_mounted_token_is_sent_as_bearer() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let creds = tempfile::tempdir().unwrap();
    std::fs::write(creds.path().join("token"), "s3cr3t\n").unwrap();

    let client =
        RayJobClient::from_mounted_credentials(&base_url, Some("ray-secret"), creds.path())
            .unwrap();
    client
        .submit(&Submission {
            entrypoint: "python script.py".to_string(),
            runtime_env: RuntimeEnv::new("gcs://_ray_pkg_cached.zip", &ScriptMetadata::default()),
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();

    assert_eq!(*state.auth.lock().unwrap(), vec!["Bearer s3cr3t".to_string()]);
}

#[tokio::test]
async fn test_no_token_without_resource_secret() {
    let state = MockState::default();
    let base_url = start_mock_server(state.clone()).await;
    let creds = tempfile::tempdir().unwrap();
    std::fs::write(creds.path().join("token"), "s3cr3t").unwrap();

    let client = RayJobClient::from_mounted_credentials(&base_url, None, creds.path()).unwrap();
    client
        .submit(&Submission {
            entrypoint: "python script.py".to_string(),
            runtime_env: RuntimeEnv::new("gcs://_ray_pkg_cached.zip", &ScriptMetadata::default()),
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap();

    assert!(state.auth.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_backend_is_connection_failure() {
    let client = RayJobClient::new("http://127.0.0.1:1", None);
    assert!(matches!(
        client.status("raysubmit_abc").await,
        Err(BackendError::ConnectionFailed { .. })
    ));
}

#[tokio::test]
async fn test_unresponsive_backend_times_out() {
    let router = Router::new().route(
        "/api/jobs/{id}",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Json(json!({ "status": "RUNNING" }))
        }),
    );
    let base_url = start_server(router).await;

    let client = RayJobClient::with_timeout(&base_url, None, Duration::from_millis(200));
    let result = tokio::time::timeout(Duration::from_secs(10), client.status("raysubmit_abc"))
        .await
        .expect("status() should give up on its own");

    assert!(matches!(result, Err(BackendError::ConnectionFailed { .. })));
}
