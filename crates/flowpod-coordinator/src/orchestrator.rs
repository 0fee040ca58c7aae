//! Orchestrator: task catalogue, run history and the router it owns
//!
//! The orchestrator scopes one registry/router pair to its own lifetime and
//! drives every run through a [`RunCoordinator`] sharing that registry.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowpod_core::{
    ClusterClient, CoordinatorConfig, Run, RunConfig, RunId, RunSnapshot, build_spec,
};
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::cancel::{CancelHandle, cancellation};
use crate::coordinator::{RunCoordinator, RunOutcome};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics::CoordinatorMetrics;
use crate::registry::ChannelRegistry;
use crate::router::EventRouter;

/// Owns a cluster connection, its router and the configured tasks
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chrono::Utc;
/// use flowpod_coordinator::Orchestrator;
/// use flowpod_core::{ClusterClient, CoordinatorConfig, RunConfig};
///
/// async fn hello(cluster: Arc<dyn ClusterClient>) -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = Orchestrator::new(cluster, CoordinatorConfig::default())?;
///     orchestrator.start().await?;
///
///     orchestrator.add_task(RunConfig::new("hello", "busybox", ["echo", "Hello World!!!"]))?;
///     let outcome = orchestrator.run("hello", Utc::now(), true).await?;
///     println!("{}", outcome.phase);
///
///     orchestrator.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    registry: ChannelRegistry,
    router: Mutex<EventRouter>,
    coordinator: RunCoordinator,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
    tasks: DashMap<String, Arc<RunConfig>>,
    history: DashMap<String, VecDeque<watch::Receiver<RunSnapshot>>>,
    active: DashMap<RunId, ActiveRun>,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    task: String,
    cancel: CancelHandle,
}

impl Orchestrator {
    /// Create an orchestrator; call [`start`](Self::start) before running tasks
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Metrics` if metrics cannot be registered.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: CoordinatorConfig,
    ) -> OrchestratorResult<Self> {
        let metrics = Arc::new(CoordinatorMetrics::new(&config.metrics_namespace)?);
        let registry = ChannelRegistry::new();
        let router = EventRouter::new(registry.clone(), Arc::clone(&cluster))
            .with_metrics(Arc::clone(&metrics));
        let coordinator = RunCoordinator::new(registry.clone(), cluster)
            .with_config(config.clone())
            .with_metrics(Arc::clone(&metrics));

        Ok(Self {
            registry,
            router: Mutex::new(router),
            coordinator,
            config,
            metrics,
            tasks: DashMap::new(),
            history: DashMap::new(),
            active: DashMap::new(),
        })
    }

    /// Start the event router
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Router` if the router is already running
    /// or the watch subscription fails.
    pub async fn start(&self) -> OrchestratorResult<()> {
        self.router.lock().await.start().await?;
        info!("Orchestrator started");
        Ok(())
    }

    /// Cancel every in-flight run and stop the router
    pub async fn shutdown(&self) {
        let cancelled = self.cancel_matching(|_| true);
        info!(cancelled, "Shutting down orchestrator");
        self.router.lock().await.stop().await;
    }

    /// True while the router is consuming the watch stream
    pub async fn is_watching(&self) -> bool {
        self.router.lock().await.is_running()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    /// Add or replace a task definition
    ///
    /// An empty namespace is filled from the configured default. Returns the
    /// definition that was replaced, if any.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Spec` if the definition cannot be turned
    /// into a resource spec.
    pub fn add_task(&self, mut config: RunConfig) -> OrchestratorResult<Option<Arc<RunConfig>>> {
        if config.namespace.is_empty() {
            config.namespace.clone_from(&self.config.default_namespace);
        }
        build_spec(&config, &RunId::generate(&config.name))?;

        let name = config.name.clone();
        let previous = self.tasks.insert(name.clone(), Arc::new(config));
        if previous.is_some() {
            info!(task = %name, "Replaced task definition");
        } else {
            info!(task = %name, "Added task");
        }
        Ok(previous)
    }

    /// Remove a task, cancelling its in-flight runs and dropping its history
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::UnknownTask` if no such task exists.
    pub fn remove_task(&self, name: &str) -> OrchestratorResult<Arc<RunConfig>> {
        let (_, config) = self
            .tasks
            .remove(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))?;

        let cancelled = self.cancel_matching(|run| run.task == name);
        self.history.remove(name);
        info!(task = %name, cancelled, "Removed task");
        Ok(config)
    }

    pub fn task(&self, name: &str) -> Option<Arc<RunConfig>> {
        self.tasks.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Every task definition, sorted by name
    pub fn tasks(&self) -> Vec<Arc<RunConfig>> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Execute one run of task `name` to completion
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::UnknownTask` for an unknown task and
    /// `OrchestratorError::Run` if the run fails to start or is cancelled.
    pub async fn run(
        &self,
        name: &str,
        execution_time: DateTime<Utc>,
        stream_logs: bool,
    ) -> OrchestratorResult<RunOutcome> {
        let config = self
            .task(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))?;

        let mut run = Run::new(config, execution_time, stream_logs);
        let run_id = run.id().clone();
        {
            let mut history = self.history.entry(name.to_string()).or_default();
            history.push_back(run.observe());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        let (cancel, signal) = cancellation();
        self.active.insert(
            run_id.clone(),
            ActiveRun {
                task: name.to_string(),
                cancel,
            },
        );
        let _active = ActiveGuard {
            active: &self.active,
            run_id,
        };

        Ok(self.coordinator.start_with_cancel(&mut run, signal).await?)
    }

    /// Snapshots of the most recent runs of task `name`, oldest first
    ///
    /// At most `history_limit` runs are remembered per task.
    pub fn runs(&self, name: &str) -> Vec<RunSnapshot> {
        self.history
            .get(name)
            .map(|runs| runs.iter().map(|rx| rx.borrow().clone()).collect())
            .unwrap_or_default()
    }

    /// Identities of runs currently in flight
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Cancel one in-flight run; returns false if it is not in flight
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        match self.active.get(run_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(run_id = %run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    fn cancel_matching(&self, matches: impl Fn(&ActiveRun) -> bool) -> usize {
        let mut cancelled = 0;
        for entry in self.active.iter() {
            if matches(entry.value()) {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

struct ActiveGuard<'a> {
    active: &'a DashMap<RunId, ActiveRun>,
    run_id: RunId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpod_core::{Phase, RunError};
    use flowpod_testing::ScriptedCluster;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_task_catalogue() {
        let cluster = Arc::new(ScriptedCluster::new());
        let orchestrator = Orchestrator::new(cluster, CoordinatorConfig::default()).unwrap();

        let first = RunConfig::new("beta", "busybox", ["true"]);
        assert!(orchestrator.add_task(first).unwrap().is_none());
        orchestrator
            .add_task(RunConfig::new("alpha", "busybox", ["true"]))
            .unwrap();

        let replaced = orchestrator
            .add_task(RunConfig::new("beta", "alpine", ["true"]))
            .unwrap();
        assert_eq!(replaced.unwrap().image, "busybox");

        let names: Vec<_> = orchestrator.tasks().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(orchestrator.task("beta").unwrap().image, "alpine");

        orchestrator.remove_task("alpha").unwrap();
        assert!(orchestrator.task("alpha").is_none());
        assert!(matches!(
            orchestrator.remove_task("alpha"),
            Err(OrchestratorError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_add_task_fills_namespace_and_validates() {
        let cluster = Arc::new(ScriptedCluster::new());
        let config = CoordinatorConfig {
            default_namespace: "batch".to_string(),
            ..CoordinatorConfig::default()
        };
        let orchestrator = Orchestrator::new(cluster, config).unwrap();

        orchestrator
            .add_task(RunConfig::new("ns", "busybox", ["true"]).with_namespace(""))
            .unwrap();
        assert_eq!(orchestrator.task("ns").unwrap().namespace, "batch");

        let invalid = RunConfig::new("empty", "busybox", Vec::<String>::new());
        assert!(matches!(
            orchestrator.add_task(invalid),
            Err(OrchestratorError::Spec(_))
        ));
    }

    #[tokio::test]
    async fn test_run_records_history() {
        let cluster = Arc::new(
            ScriptedCluster::new().with_script(|_| vec![Phase::Running, Phase::Succeeded]),
        );
        let orchestrator = Orchestrator::new(cluster, CoordinatorConfig::default()).unwrap();
        orchestrator.start().await.unwrap();
        orchestrator
            .add_task(RunConfig::new("hello", "busybox", ["true"]))
            .unwrap();

        let outcome = timeout(WAIT, orchestrator.run("hello", Utc::now(), false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.phase, Phase::Succeeded);

        let runs = orchestrator.runs("hello");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, outcome.run_id);
        assert_eq!(runs[0].phase, Phase::Succeeded);
        assert!(runs[0].ended_at.is_some());
        assert!(orchestrator.active_runs().is_empty());
        assert_eq!(orchestrator.metrics().completed(Phase::Succeeded), 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_runs() {
        let cluster = Arc::new(
            ScriptedCluster::new().with_script(|_| vec![Phase::Running, Phase::Succeeded]),
        );
        let config = CoordinatorConfig {
            history_limit: 2,
            ..CoordinatorConfig::default()
        };
        let orchestrator = Orchestrator::new(cluster, config).unwrap();
        orchestrator.start().await.unwrap();
        orchestrator
            .add_task(RunConfig::new("repeat", "busybox", ["true"]))
            .unwrap();

        let mut finished = Vec::new();
        for _ in 0..3 {
            let outcome = timeout(WAIT, orchestrator.run("repeat", Utc::now(), false))
                .await
                .unwrap()
                .unwrap();
            finished.push(outcome.run_id);
        }

        let remembered: Vec<_> = orchestrator
            .runs("repeat")
            .into_iter()
            .map(|snapshot| snapshot.run_id)
            .collect();
        assert_eq!(remembered, finished[1..].to_vec());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let cluster = Arc::new(ScriptedCluster::new());
        let orchestrator = Orchestrator::new(cluster, CoordinatorConfig::default()).unwrap();
        let err = orchestrator.run("nope", Utc::now(), false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTask(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_remove_task_cancels_runs() {
        let cluster = Arc::new(ScriptedCluster::new().with_script(|_| vec![Phase::Running]));
        let orchestrator =
            Arc::new(Orchestrator::new(cluster.clone(), CoordinatorConfig::default()).unwrap());
        orchestrator.start().await.unwrap();
        orchestrator
            .add_task(RunConfig::new("forever", "busybox", ["sleep", "3600"]))
            .unwrap();

        let running = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run("forever", Utc::now(), false).await })
        };

        timeout(WAIT, async {
            while orchestrator.active_runs().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        orchestrator.remove_task("forever").unwrap();
        let result = timeout(WAIT, running).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(OrchestratorError::Run(RunError::Cancelled { .. }))
        ));
        assert_eq!(cluster.deleted().len(), 1);
        assert!(orchestrator.runs("forever").is_empty());

        orchestrator.shutdown().await;
    }
}
