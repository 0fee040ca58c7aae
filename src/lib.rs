//! # Flowpod
//!
//! Flowpod executes runs of configured tasks as isolated resources on a
//! shared cluster and follows each run to a terminal phase, optionally
//! streaming its output back to the caller.
//!
//! ## Core Components
//!
//! - **[ChannelRegistry]**: concurrent map from run identity to its signal pair
//! - **[EventRouter]**: single consumer of the cluster watch stream
//! - **[RunCoordinator]**: drives one [Run] from creation to a terminal [Phase]
//! - **[Orchestrator]**: task catalogue and run history over one router
//! - **[ClusterClient]**: the seam every cluster backend implements
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use flowpod::{CoordinatorConfig, LocalCluster, Orchestrator, Phase, RunConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Arc::new(LocalCluster::new());
//! let orchestrator = Orchestrator::new(cluster, CoordinatorConfig::default())?;
//! orchestrator.start().await?;
//! orchestrator.add_task(RunConfig::new("hello", "busybox", ["echo", "Hello World!!!"]))?;
//!
//! let outcome = orchestrator.run("hello", Utc::now(), true).await?;
//! assert_eq!(outcome.phase, Phase::Succeeded);
//! if let Some(logs) = outcome.logs {
//!     let (lines, _) = logs.collect_lines().await;
//!     assert_eq!(lines, vec!["Hello World!!!"]);
//! }
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Module aliases for namespaced access
// ============================================================================

pub use flowpod_coordinator as coordinator;
pub use flowpod_core as core;

#[cfg(feature = "local")]
pub use flowpod_local as local;

#[cfg(feature = "testing")]
pub use flowpod_testing as testing;

// ============================================================================
// Runs, phases and configuration
// ============================================================================

pub use flowpod_core::{
    Phase, ResourceLimits, ResourceSpec, RestartPolicy, RetryPolicy, Run, RunConfig, RunId,
    RunSnapshot, build_spec,
};

pub use flowpod_core::{CoordinatorConfig, CoordinatorConfigBuilder, RetentionPolicy};

// ============================================================================
// Cluster seam
// ============================================================================

pub use flowpod_core::{ClusterClient, EventKind, OutputStream, WatchEvent, WatchStream};

// ============================================================================
// Errors
// ============================================================================

pub use flowpod_core::{
    ClusterError, ClusterResult, ConfigError, RegistryError, RunError, RunResult, SpecError,
    StreamError,
};

pub use flowpod_coordinator::{MetricsError, OrchestratorError, RouterError};

// ============================================================================
// Coordination
// ============================================================================

pub use flowpod_coordinator::{
    CancelHandle, CancelSignal, ChannelRegistry, CoordinatorMetrics, EventRouter, LogStream,
    Orchestrator, RunCoordinator, RunOutcome, cancellation,
};

// ============================================================================
// Backends
// ============================================================================

#[cfg(feature = "local")]
pub use flowpod_local::{LocalCluster, LocalClusterConfig};

#[cfg(feature = "testing")]
pub use flowpod_testing::ScriptedCluster;
