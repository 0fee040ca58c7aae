//! # Flowpod Coordinator
//!
//! Bridges the cluster's single shared watch stream into per-run waits.
//!
//! ## Architecture
//!
//! ```text
//! cluster watch ──▶ EventRouter ──lookup──▶ ChannelRegistry
//!                        │                       │
//!                        └──deliver──▶ ChannelSignaller ─▶ ChannelGroup ─▶ RunCoordinator
//!                                                                             │
//!                                                                  LogStreamer (once Ready)
//! ```
//!
//! A [`RunCoordinator`] registers its run before creating the resource,
//! then blocks on its own [`ChannelGroup`] until a terminal phase. The
//! [`EventRouter`] never blocks on a group, so one slow run cannot delay
//! another. The [`Orchestrator`] ties a registry, a router and a task
//! catalogue together.

pub mod cancel;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod router;

pub use cancel::{CancelHandle, CancelSignal, cancellation};
pub use channel::{ChannelGroup, ChannelSignaller, RouteDecision, RouteState, route};
pub use coordinator::{RunCoordinator, RunOutcome};
pub use error::{OrchestratorError, OrchestratorResult, RouterError, RouterResult};
pub use logs::{LogStream, LogStreamer};
pub use metrics::{CoordinatorMetrics, MetricsError, SignalChannel};
pub use orchestrator::Orchestrator;
pub use registry::{ChannelRegistry, Registration};
pub use router::{EventRouter, dispatch};
