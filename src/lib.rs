//! In-pod bridge agent.
//!
//! Runs beside a scheduled pod: reads a job description from a Kubernetes
//! ConfigMap, stages the job's inputs, submits the job to a Ray cluster and
//! relays its status back through the same ConfigMap until it finishes.

pub mod agent;
pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod job;
pub mod resolver;
pub mod storage;
pub mod supervisor;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use supervisor::Outcome;
