//! Translation of a run configuration into a cluster resource spec

use crate::error::SpecError;
use crate::identity::RunId;
use crate::run_config::{ResourceLimits, RetryPolicy, RunConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the task name on every resource
pub const TASK_LABEL: &str = "flowpod/task";
/// Label carrying the run identity on every resource
pub const RUN_ID_LABEL: &str = "flowpod/run-id";

/// Container restart behaviour requested from the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Never,
    OnFailure,
}

impl From<RetryPolicy> for RestartPolicy {
    fn from(policy: RetryPolicy) -> Self {
        match policy {
            RetryPolicy::Never => Self::Never,
            RetryPolicy::OnFailure => Self::OnFailure,
        }
    }
}

/// Creation request for one run's cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource name, identical to the run identity
    pub name: RunId,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub restart_policy: RestartPolicy,
    /// Restarts allowed before the resource is marked failed
    pub backoff_limit: u32,
    /// Cluster-side deadline in seconds
    pub active_deadline_secs: Option<u64>,
    pub parallelism: u32,
    pub resources: ResourceLimits,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Build the resource creation request for run `run_id` of `config`
///
/// Pure translation: no I/O and no cluster access.
pub fn build_spec(config: &RunConfig, run_id: &RunId) -> Result<ResourceSpec, SpecError> {
    if config.name.trim().is_empty() {
        return Err(SpecError::EmptyName);
    }
    if config.namespace.trim().is_empty() {
        return Err(SpecError::EmptyNamespace(config.name.clone()));
    }
    if config.image.trim().is_empty() {
        return Err(SpecError::EmptyImage(config.name.clone()));
    }
    if config.command.is_empty() || config.command[0].trim().is_empty() {
        return Err(SpecError::EmptyCommand(config.name.clone()));
    }

    let mut labels = config.labels.clone();
    labels.insert(TASK_LABEL.to_string(), config.name.clone());
    labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());

    let backoff_limit = match config.retry_policy {
        RetryPolicy::Never => 0,
        RetryPolicy::OnFailure => config.retries,
    };

    Ok(ResourceSpec {
        name: run_id.clone(),
        namespace: config.namespace.clone(),
        image: config.image.clone(),
        command: config.command.clone(),
        restart_policy: config.retry_policy.into(),
        backoff_limit,
        active_deadline_secs: config.time_limit_secs,
        parallelism: config.parallelism.max(1),
        resources: config.resources.clone(),
        labels,
        annotations: config.annotations.clone(),
    })
}
