//! Error types shared across flowpod crates

use crate::identity::RunId;
use thiserror::Error;

/// Result type for cluster client operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Result type for running a single run to completion
pub type RunResult<T> = Result<T, RunError>;

/// Errors reported by a cluster backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The cluster refused the creation request
    #[error("Create rejected for {run_id}: {reason}")]
    CreateRejected { run_id: RunId, reason: String },

    /// A resource with this identity already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(RunId),

    /// No resource with this identity exists
    #[error("Resource not found: {0}")]
    NotFound(RunId),

    /// The workload could not be launched
    #[error("Failed to spawn workload for {run_id}: {reason}")]
    Spawn { run_id: RunId, reason: String },

    /// The shared watch subscription failed or produced a bad item
    #[error("Watch error: {0}")]
    Watch(String),

    /// Reading a resource's output failed
    #[error("Output stream error for {run_id}: {reason}")]
    Output { run_id: RunId, reason: String },

    /// Backend-specific error
    #[error("Cluster error: {0}")]
    Other(String),
}

/// Errors from the channel registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An entry for this identity is already present
    #[error("Run {run_id} is already registered")]
    AlreadyRegistered { run_id: RunId },
}

/// Invalid run configuration caught while building a resource spec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Run configuration has an empty name")]
    EmptyName,

    #[error("Run configuration '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("Run configuration '{0}' has an empty image")]
    EmptyImage(String),

    #[error("Run configuration '{0}' has an empty namespace")]
    EmptyNamespace(String),
}

/// Setup-time failures that abort a run
///
/// Loss of observation is not an error: it surfaces as
/// [`Phase::Unknown`](crate::Phase::Unknown) in the outcome.
#[derive(Error, Debug)]
pub enum RunError {
    /// The cluster rejected the creation request
    #[error("Failed to create resource for run {run_id}: {source}")]
    Creation {
        run_id: RunId,
        #[source]
        source: ClusterError,
    },

    /// The run identity collided with an in-flight run
    #[error(transparent)]
    AlreadyRegistered(#[from] RegistryError),

    /// The run configuration could not be translated into a resource spec
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// The caller cancelled the run before it reached a terminal phase
    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: RunId },

    /// `start` was called on a run that has already been started
    #[error("Run {run_id} has already been started")]
    AlreadyStarted { run_id: RunId },
}

impl RunError {
    /// Identity of the run this error refers to, when one is known
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Creation { run_id, .. }
            | Self::Cancelled { run_id }
            | Self::AlreadyStarted { run_id } => Some(run_id),
            Self::AlreadyRegistered(RegistryError::AlreadyRegistered { run_id }) => Some(run_id),
            Self::Spec(_) => None,
        }
    }
}

/// Log streaming failures, reported next to the outcome
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Attaching to or reading from the output stream failed
    #[error("Log stream for {run_id} interrupted: {reason}")]
    Interrupted { run_id: RunId, reason: String },
}
