//! Event router: demultiplexes the shared watch stream
//!
//! One router consumes the cluster's single watch subscription and fans
//! each notification out to the channel group of the run it names. All
//! deliveries are non-blocking, so a run whose coordinator is slow (or
//! gone) never delays notifications for any other run. Within one identity
//! signals keep the order in which the router observed them; across
//! identities no order is promised.

use std::sync::Arc;

use flowpod_core::{ClusterClient, WatchEvent, WatchStream};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::RouteDecision;
use crate::error::{RouterError, RouterResult};
use crate::metrics::{CoordinatorMetrics, SignalChannel};
use crate::registry::ChannelRegistry;

/// Single consumer of the cluster watch stream
///
/// Stopping the router halts future delivery only; coordinators already
/// waiting on their channel groups stay blocked until cancelled by their
/// callers.
pub struct EventRouter {
    registry: ChannelRegistry,
    cluster: Arc<dyn ClusterClient>,
    metrics: Option<Arc<CoordinatorMetrics>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EventRouter {
    pub fn new(registry: ChannelRegistry, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            registry,
            cluster,
            metrics: None,
            shutdown: None,
            task: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<CoordinatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Subscribe to the watch stream and start consuming it on its own task
    ///
    /// The subscription is open by the time this returns, so any resource
    /// created afterwards is observed.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::AlreadyStarted` if the router is running, or
    /// `RouterError::Subscribe` if the cluster refuses the subscription.
    pub async fn start(&mut self) -> RouterResult<()> {
        if self.is_running() {
            return Err(RouterError::AlreadyStarted);
        }

        let stream = self.cluster.watch().await.map_err(RouterError::Subscribe)?;
        self.registry.observation_restored();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(consume(
            stream,
            shutdown_rx,
            self.registry.clone(),
            self.metrics.clone(),
        ));

        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        info!("Event router started");
        Ok(())
    }

    /// Stop consuming and release the subscription
    ///
    /// Idempotent. Waits for the consume loop to exit.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Event router task ended abnormally");
            }
            info!("Event router stopped");
        }
    }

    /// True while the consume loop is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn consume(
    mut stream: WatchStream,
    mut shutdown: oneshot::Receiver<()>,
    registry: ChannelRegistry,
    metrics: Option<Arc<CoordinatorMetrics>>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("Event router received shutdown");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    dispatch(&registry, metrics.as_deref(), &event);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Discarding malformed watch item");
                    if let Some(metrics) = metrics.as_deref() {
                        metrics.record_discarded();
                    }
                }
                None => {
                    warn!(
                        tracked = registry.len(),
                        "Watch stream ended unexpectedly, marking tracked runs as Unknown"
                    );
                    let signalled = registry.mark_observation_lost();
                    info!(signalled, "Resolved tracked runs after watch loss");
                    break;
                }
            }
        }
    }
}

/// Route one event to its channel group, if the identity is tracked
///
/// Returns the signals delivered, or `None` when the event was discarded.
pub fn dispatch(
    registry: &ChannelRegistry,
    metrics: Option<&CoordinatorMetrics>,
    event: &WatchEvent,
) -> Option<RouteDecision> {
    if let Some(metrics) = metrics {
        metrics.record_watch_event(event.kind);
    }

    let Some(signaller) = registry.lookup(&event.run_id) else {
        debug!(
            run_id = %event.run_id,
            kind = %event.kind,
            phase = %event.phase,
            "Discarding event for untracked run"
        );
        if let Some(metrics) = metrics {
            metrics.record_discarded();
        }
        return None;
    };

    let decision = signaller.deliver(event);

    if decision.regression {
        warn!(
            run_id = %event.run_id,
            phase = %event.phase,
            "Ignoring phase regression"
        );
    }
    if let Some(metrics) = metrics {
        if decision.ready {
            metrics.record_signal(SignalChannel::Ready);
        }
        if decision.update.is_some() {
            metrics.record_signal(SignalChannel::Update);
        }
    }
    debug!(
        run_id = %event.run_id,
        kind = %event.kind,
        observed = %event.phase,
        ready = decision.ready,
        update = ?decision.update,
        "Routed watch event"
    );

    Some(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpod_core::{Phase, RunId};
    use flowpod_testing::ScriptedCluster;
    use std::time::Duration;
    use tokio::time::timeout;

    fn id(s: &str) -> RunId {
        RunId::parse(s).unwrap()
    }

    #[test]
    fn test_dispatch_untracked_is_discarded() {
        let registry = ChannelRegistry::new();
        let metrics = CoordinatorMetrics::new("test").unwrap();

        let decision = dispatch(
            &registry,
            Some(&metrics),
            &WatchEvent::updated(id("stranger"), Phase::Running),
        );
        assert!(decision.is_none());
        assert_eq!(metrics.discarded(), 1);
    }

    #[tokio::test]
    async fn test_router_delivers_to_registered_group() {
        let cluster = Arc::new(ScriptedCluster::new());
        let registry = ChannelRegistry::new();
        let mut router = EventRouter::new(registry.clone(), cluster.clone());
        router.start().await.unwrap();

        let run_id = id("routed");
        let mut group = registry.register(&run_id).unwrap();

        cluster.emit(WatchEvent::added(run_id.clone(), Phase::Pending));
        cluster.emit(WatchEvent::updated(run_id.clone(), Phase::Running));

        let wait = Duration::from_secs(5);
        assert_eq!(
            timeout(wait, group.next_update()).await.unwrap(),
            Some(Phase::Pending)
        );
        assert_eq!(
            timeout(wait, group.next_update()).await.unwrap(),
            Some(Phase::Running)
        );
        assert!(group.try_ready());

        router.stop().await;
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let cluster = Arc::new(ScriptedCluster::new());
        let mut router = EventRouter::new(ChannelRegistry::new(), cluster);

        router.start().await.unwrap();
        assert!(matches!(
            router.start().await,
            Err(RouterError::AlreadyStarted)
        ));
        router.stop().await;
        router.stop().await;
    }

    #[tokio::test]
    async fn test_watch_loss_marks_unknown() {
        let cluster = Arc::new(ScriptedCluster::new());
        let registry = ChannelRegistry::new();
        let mut router = EventRouter::new(registry.clone(), cluster.clone());
        router.start().await.unwrap();

        let run_id = id("lost");
        let mut group = registry.register(&run_id).unwrap();
        cluster.emit(WatchEvent::added(run_id.clone(), Phase::Pending));
        cluster.close_watch();

        let wait = Duration::from_secs(5);
        assert_eq!(
            timeout(wait, group.next_update()).await.unwrap(),
            Some(Phase::Pending)
        );
        assert_eq!(
            timeout(wait, group.next_update()).await.unwrap(),
            Some(Phase::Unknown)
        );
    }

    #[tokio::test]
    async fn test_malformed_items_do_not_stop_router() {
        let cluster = Arc::new(ScriptedCluster::new());
        let registry = ChannelRegistry::new();
        let metrics = Arc::new(CoordinatorMetrics::new("test").unwrap());
        let mut router =
            EventRouter::new(registry.clone(), cluster.clone()).with_metrics(metrics.clone());
        router.start().await.unwrap();

        let run_id = id("survivor");
        let mut group = registry.register(&run_id).unwrap();
        cluster.emit_error("garbled notification");
        cluster.emit(WatchEvent::updated(run_id.clone(), Phase::Succeeded));

        assert_eq!(
            timeout(Duration::from_secs(5), group.next_update())
                .await
                .unwrap(),
            Some(Phase::Succeeded)
        );
        assert!(router.is_running());
        assert_eq!(metrics.discarded(), 1);
        router.stop().await;
    }
}
