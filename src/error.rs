//! Error types for the bridge agent.

use std::path::PathBuf;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reading or writing the shared control object.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control object {name} not found")]
    NotFound { name: String },

    #[error("Control object {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Control object {name} is empty")]
    Empty { name: String },

    #[error("Failed to write control object {name}: {reason}")]
    WriteFailed { name: String, reason: String },
}

/// Errors resolving the job's script, metadata and parameters.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Unsupported location {value:?} for {field}")]
    UnsupportedLocation { field: String, value: String },

    #[error("Malformed object locator {value:?}, expected bucket:key")]
    MalformedLocator { value: String },

    #[error("Malformed metadata in {field}: {reason}")]
    MalformedMetadata { field: String, reason: String },

    #[error("{field} references object storage but no object store is configured")]
    ObjectStoreRequired { field: String },

    #[error("Failed to fetch {bucket}:{key}: {reason}")]
    FetchFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Failed to stage {path}: {source}")]
    StageFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("Failed to read credential file {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid object store endpoint {endpoint:?}")]
    InvalidEndpoint { endpoint: String },

    #[error("{operation} on {bucket}/{key} failed: {reason}")]
    RequestFailed {
        operation: &'static str,
        bucket: String,
        key: String,
        reason: String,
    },
}

/// Remote execution backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to connect to backend at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Backend rejected {operation}: {status} {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid backend response for {operation}: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("Unknown job status {0:?}")]
    UnknownStatus(String),

    #[error("Failed to package working directory {path}: {reason}")]
    PackagingFailed { path: PathBuf, reason: String },

    #[error("Failed to read credential file {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
