//! # Environment-Based Configuration
//!
//! Coordinator settings can be supplied programmatically through
//! [`CoordinatorConfigBuilder`] or read from the environment.
//!
//! ## Environment Variables
//!
//! - `FLOWPOD_DEFAULT_NAMESPACE` - Namespace for tasks that do not name one (default: "default")
//! - `FLOWPOD_LOG_BUFFER_LINES` - Capacity of each run's log line channel (default: 1024)
//! - `FLOWPOD_DELETE_ON_COMPLETION` - Delete resources of terminal runs (default: false)
//! - `FLOWPOD_METRICS_NAMESPACE` - Prefix for Prometheus metric names (default: "flowpod")
//! - `FLOWPOD_HISTORY_LIMIT` - Runs remembered per task for reporting (default: 100)

use std::env;

use tracing::debug;

use crate::run_config::DEFAULT_NAMESPACE;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// What happens to a run's cluster resource after it reaches a terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Leave the resource for inspection
    #[default]
    Keep,
    /// Request deletion once the run is terminal
    DeleteOnCompletion,
}

/// Settings shared by the router, coordinators and orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub default_namespace: String,
    pub log_buffer_lines: usize,
    pub retention: RetentionPolicy,
    pub metrics_namespace: String,
    /// Most recent runs kept per task; older ones are forgotten
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            log_buffer_lines: 1024,
            retention: RetentionPolicy::Keep,
            metrics_namespace: "flowpod".to_string(),
            history_limit: 100,
        }
    }
}

impl CoordinatorConfig {
    /// Load from the environment and validate
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        CoordinatorConfigBuilder::from_env()?.build()
    }
}

/// Builder for [`CoordinatorConfig`] with environment variable support
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from defaults and apply any `FLOWPOD_*` variables that are set
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::default();

        if let Some(namespace) = get_env_string("FLOWPOD_DEFAULT_NAMESPACE") {
            debug!(namespace = %namespace, "Default namespace from environment");
            builder = builder.default_namespace(namespace);
        }
        if let Some(lines) = get_env_usize("FLOWPOD_LOG_BUFFER_LINES")? {
            debug!(lines, "Log buffer size from environment");
            builder = builder.log_buffer_lines(lines);
        }
        if let Some(delete) = get_env_bool("FLOWPOD_DELETE_ON_COMPLETION")? {
            debug!(delete, "Retention policy from environment");
            builder = builder.retention(if delete {
                RetentionPolicy::DeleteOnCompletion
            } else {
                RetentionPolicy::Keep
            });
        }
        if let Some(namespace) = get_env_string("FLOWPOD_METRICS_NAMESPACE") {
            debug!(namespace = %namespace, "Metrics namespace from environment");
            builder = builder.metrics_namespace(namespace);
        }
        if let Some(limit) = get_env_usize("FLOWPOD_HISTORY_LIMIT")? {
            debug!(limit, "History limit from environment");
            builder = builder.history_limit(limit);
        }

        Ok(builder)
    }

    #[must_use]
    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.default_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn log_buffer_lines(mut self, lines: usize) -> Self {
        self.config.log_buffer_lines = lines;
        self
    }

    #[must_use]
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    #[must_use]
    pub fn metrics_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.metrics_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.config.history_limit = limit;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.config.default_namespace.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_namespace cannot be empty".to_string(),
            ));
        }
        if self.config.log_buffer_lines == 0 {
            return Err(ConfigError::ValidationError(
                "log_buffer_lines must be greater than 0".to_string(),
            ));
        }
        if self.config.history_limit == 0 {
            return Err(ConfigError::ValidationError(
                "history_limit must be greater than 0".to_string(),
            ));
        }
        if self.config.metrics_namespace.is_empty()
            || !self
                .config
                .metrics_namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::ValidationError(
                "metrics_namespace must be non-empty and contain only [A-Za-z0-9_]".to_string(),
            ));
        }
        Ok(())
    }
}

// Environment variable helper functions

fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
