//! # Flowpod Core
//!
//! Shared vocabulary for the flowpod run coordinator: run identities, the
//! lifecycle [`Phase`] enumeration, run configuration and its translation
//! into a cluster [`ResourceSpec`], the [`Run`] record itself, and the
//! [`ClusterClient`] seam that every cluster backend implements.
//!
//! Nothing in this crate blocks or spawns; coordination lives in
//! `flowpod-coordinator`.

pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;
pub mod phase;
pub mod resource;
pub mod run;
pub mod run_config;

pub use cluster::{ClusterClient, EventKind, OutputStream, WatchEvent, WatchStream};
pub use config::{ConfigError, CoordinatorConfig, CoordinatorConfigBuilder, RetentionPolicy};
pub use error::{
    ClusterError, ClusterResult, RegistryError, RunError, RunResult, SpecError, StreamError,
};
pub use identity::{RunId, RunIdError};
pub use phase::{Phase, PhaseParseError};
pub use resource::{ResourceSpec, RestartPolicy, build_spec};
pub use run::{Run, RunSnapshot};
pub use run_config::{ResourceLimits, RetryPolicy, RunConfig};
