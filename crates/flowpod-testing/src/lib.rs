//! # Flowpod Testing
//!
//! Deterministic cluster backend for exercising run coordination without a
//! real cluster.
//!
//! ## Usage
//!
//! ```rust
//! use flowpod_core::Phase;
//! use flowpod_testing::ScriptedCluster;
//!
//! // Every created resource goes Pending -> Running -> Succeeded
//! let cluster = ScriptedCluster::new()
//!     .with_script(|_| vec![Phase::Running, Phase::Succeeded])
//!     .with_output(|spec| spec.command.clone());
//! assert!(cluster.created().is_empty());
//! ```

/// Scripted `ClusterClient` implementation
pub mod scripted;

pub use scripted::{JournalEntry, ScriptedCluster};
