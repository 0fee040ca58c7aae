//! Cluster client seam
//!
//! Every cluster backend implements [`ClusterClient`]. The coordinator only
//! ever talks to the cluster through this trait, which keeps the lifecycle
//! logic testable against scripted or local backends.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use crate::{error::ClusterResult, identity::RunId, phase::Phase, resource::ResourceSpec};

/// Shared stream of resource state-change notifications
pub type WatchStream = Pin<Box<dyn Stream<Item = ClusterResult<WatchEvent>> + Send + 'static>>;

/// Live output of one resource, one line per item
pub type OutputStream = Pin<Box<dyn Stream<Item = ClusterResult<String>> + Send + 'static>>;

/// Kind of change a watch notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification from the shared watch stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub run_id: RunId,
    pub phase: Phase,
    pub kind: EventKind,
}

impl WatchEvent {
    pub fn new(run_id: RunId, phase: Phase, kind: EventKind) -> Self {
        Self {
            run_id,
            phase,
            kind,
        }
    }

    pub fn added(run_id: RunId, phase: Phase) -> Self {
        Self::new(run_id, phase, EventKind::Add)
    }

    pub fn updated(run_id: RunId, phase: Phase) -> Self {
        Self::new(run_id, phase, EventKind::Update)
    }

    pub fn deleted(run_id: RunId, phase: Phase) -> Self {
        Self::new(run_id, phase, EventKind::Delete)
    }
}

/// Operations the coordinator needs from a cluster
///
/// # Example
///
/// ```rust,no_run
/// use flowpod_core::{ClusterClient, RunConfig, RunId, build_spec};
///
/// async fn launch(cluster: &dyn ClusterClient) -> Result<(), Box<dyn std::error::Error>> {
///     let config = RunConfig::new("hello", "busybox", ["echo", "hi"]);
///     let run_id = RunId::generate(&config.name);
///     let spec = build_spec(&config, &run_id)?;
///     cluster.create(&spec).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a creation request, returning the identity the cluster assigned
    ///
    /// # Errors
    ///
    /// Returns `ClusterError` if the request is rejected.
    async fn create(&self, spec: &ResourceSpec) -> ClusterResult<RunId>;

    /// Delete a resource, terminating its workload if still running
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::NotFound` if no such resource exists.
    async fn delete(&self, run_id: &RunId) -> ClusterResult<()>;

    /// Attach to a resource's output
    ///
    /// The returned stream yields every line produced so far and then
    /// follows live output until the container terminates.
    async fn output_stream(&self, run_id: &RunId) -> ClusterResult<OutputStream>;

    /// Subscribe to state changes of every resource on the cluster
    ///
    /// Only notifications produced after the call are guaranteed to be seen.
    async fn watch(&self) -> ClusterResult<WatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use futures::{StreamExt, stream};

    struct NullCluster;

    #[async_trait]
    impl ClusterClient for NullCluster {
        async fn create(&self, spec: &ResourceSpec) -> ClusterResult<RunId> {
            Ok(spec.name.clone())
        }

        async fn delete(&self, run_id: &RunId) -> ClusterResult<()> {
            Err(ClusterError::NotFound(run_id.clone()))
        }

        async fn output_stream(&self, _run_id: &RunId) -> ClusterResult<OutputStream> {
            Ok(Box::pin(stream::empty()))
        }

        async fn watch(&self) -> ClusterResult<WatchStream> {
            Ok(Box::pin(stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_trait_object_usage() {
        let cluster: Box<dyn ClusterClient> = Box::new(NullCluster);
        let run_id = RunId::parse("null-1").unwrap();

        assert!(matches!(
            cluster.delete(&run_id).await,
            Err(ClusterError::NotFound(_))
        ));
        let mut watch = cluster.watch().await.unwrap();
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_event_constructors() {
        let run_id = RunId::parse("e-1").unwrap();
        let event = WatchEvent::deleted(run_id.clone(), Phase::Running);
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.phase, Phase::Running);
        assert_eq!(event.run_id, run_id);
        assert_eq!(EventKind::Update.to_string(), "update");
    }
}
