//! Error types for routing and orchestration

use flowpod_core::{ClusterError, RunError, SpecError};
use thiserror::Error;

use crate::metrics::MetricsError;

/// Result type for event router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors starting the event router
#[derive(Error, Debug)]
pub enum RouterError {
    /// `start` was called while the router is already consuming
    #[error("Event router is already running")]
    AlreadyStarted,

    /// The watch subscription could not be opened
    #[error("Failed to subscribe to cluster watch: {0}")]
    Subscribe(#[source] ClusterError),
}

/// Errors from the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No task named '{0}'")]
    UnknownTask(String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}
