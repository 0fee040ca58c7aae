//! Immutable run configuration
//!
//! A [`RunConfig`] describes *what* to execute: image, command, limits and
//! retry policy. Loading it from disk is the caller's business; the type is
//! serde-friendly so any loader can produce it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Namespace used when a configuration does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// What the cluster does when a container exits with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// A failed container ends the run
    #[default]
    Never,
    /// The cluster restarts the container up to `retries` times
    OnFailure,
}

/// Resource limits requested for the container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit in cluster notation, e.g. `500m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory limit in cluster notation, e.g. `128Mi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Configuration shared by every run of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub retries: u32,
    /// Maximum runtime enforced by the cluster, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u64>,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_parallelism() -> u32 {
    1
}

impl RunConfig {
    /// Minimal configuration running `command` in `image`
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        command: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            retry_policy: RetryPolicy::Never,
            retries: 0,
            time_limit_secs: None,
            parallelism: default_parallelism(),
            resources: ResourceLimits::default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_secs = Some(limit.as_secs().max(1));
        self
    }

    #[must_use]
    pub fn with_retries(mut self, policy: RetryPolicy, retries: u32) -> Self {
        self.retry_policy = policy;
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Cluster-enforced deadline, if any
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = RunConfig::new("hello", "busybox", ["echo", "hi"]);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.command, vec!["echo", "hi"]);
        assert_eq!(config.retry_policy, RetryPolicy::Never);
        assert_eq!(config.parallelism, 1);
        assert!(config.time_limit().is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{
                "name": "report",
                "image": "busybox",
                "command": ["sh", "-c", "exit 0"],
                "retry_policy": "on_failure",
                "retries": 2,
                "time_limit_secs": 20
            }"#,
        )
        .unwrap();

        assert_eq!(config.namespace, "default");
        assert_eq!(config.retry_policy, RetryPolicy::OnFailure);
        assert_eq!(config.retries, 2);
        assert_eq!(config.time_limit(), Some(Duration::from_secs(20)));
        assert!(config.labels.is_empty());
    }

    #[test]
    fn test_sub_second_time_limit_rounds_up() {
        let config =
            RunConfig::new("t", "busybox", ["true"]).with_time_limit(Duration::from_millis(10));
        assert_eq!(config.time_limit_secs, Some(1));
    }
}
