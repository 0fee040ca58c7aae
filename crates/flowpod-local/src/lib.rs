//! # Flowpod Local
//!
//! A [`ClusterClient`](flowpod_core::ClusterClient) that runs each resource
//! as a child process on the host. Phases follow the process: `Pending` on
//! acceptance, `Running` once spawned, then `Succeeded` or `Failed` from
//! its exit status. Active deadlines and on-failure restarts from the
//! resource spec are honoured.

pub mod cluster;
pub mod output;

pub use cluster::{LocalCluster, LocalClusterConfig};
pub use output::OutputLog;
