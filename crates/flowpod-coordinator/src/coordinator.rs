//! Run coordinator: drives one run from creation to a terminal phase

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowpod_core::{
    ClusterClient, ClusterError, CoordinatorConfig, Phase, RetentionPolicy, Run, RunError, RunId,
    RunResult, build_spec,
};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::logs::{LogStream, LogStreamer};
use crate::metrics::CoordinatorMetrics;
use crate::registry::{ChannelRegistry, Registration};

/// Result of a run that reached a terminal phase
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Output lines, present when logs were requested and the run became loggable
    pub logs: Option<LogStream>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Succeeded
    }
}

/// Drives runs against a cluster through a shared channel registry
///
/// Any number of runs may be driven concurrently from clones of the same
/// coordinator. The registry must be served by a started
/// [`EventRouter`](crate::EventRouter), otherwise runs wait forever (or
/// until cancelled).
#[derive(Clone)]
pub struct RunCoordinator {
    registry: ChannelRegistry,
    cluster: Arc<dyn ClusterClient>,
    config: CoordinatorConfig,
    metrics: Option<Arc<CoordinatorMetrics>>,
}

impl RunCoordinator {
    pub fn new(registry: ChannelRegistry, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            registry,
            cluster,
            config: CoordinatorConfig::default(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<CoordinatorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Execute `run` to completion
    ///
    /// # Errors
    ///
    /// See [`start_with_cancel`](Self::start_with_cancel).
    pub async fn start(&self, run: &mut Run) -> RunResult<RunOutcome> {
        self.start_with_cancel(run, CancelSignal::never()).await
    }

    /// Execute `run` to completion unless `cancel` fires first
    ///
    /// Returns once a terminal phase is observed. Loss of observation is
    /// reported as [`Phase::Unknown`] in the outcome, not as an error.
    ///
    /// # Errors
    ///
    /// - `RunError::AlreadyStarted` if `run` was started before
    /// - `RunError::Spec` if the configuration cannot be translated
    /// - `RunError::AlreadyRegistered` if another run holds the identity
    /// - `RunError::Creation` if the cluster rejects the resource
    /// - `RunError::Cancelled` if `cancel` fires before a terminal phase
    pub async fn start_with_cancel(
        &self,
        run: &mut Run,
        mut cancel: CancelSignal,
    ) -> RunResult<RunOutcome> {
        let run_id = run.id().clone();
        if run.started_at().is_some() {
            return Err(RunError::AlreadyStarted { run_id });
        }

        let spec = build_spec(run.config(), &run_id)?;

        // Must precede create so no notification for this identity is missed
        let mut registration = self.registry.register_scoped(&run_id)?;
        run.mark_started();
        let _in_flight = self.metrics.clone().map(InFlight::enter);
        info!(run_id = %run_id, task = %run.config().name, "Registered run");

        if self.registry.is_observation_lost() {
            warn!(run_id = %run_id, "Watch stream lost, not creating resource");
            drop(registration);
            run.advance(Phase::Unknown);
            return Ok(self.finish(run, None));
        }

        match self.cluster.create(&spec).await {
            Ok(assigned) if assigned == run_id => {
                info!(run_id = %run_id, "Created resource");
            }
            Ok(assigned) => {
                self.delete_resource(&assigned).await;
                let source = ClusterError::Other(format!(
                    "cluster assigned identity {assigned}, expected {run_id}"
                ));
                return Err(self.creation_failed(run, registration, source));
            }
            Err(source) => {
                return Err(self.creation_failed(run, registration, source));
            }
        }

        let mut streamer: Option<LogStreamer> = None;

        while !run.phase().is_terminal() {
            let received = tokio::select! {
                update = registration.group().next_update() => Some(update),
                () = cancel.cancelled() => None,
            };
            let Some(update) = received else {
                return Err(self.abandon(run, registration, streamer).await);
            };

            let phase = update.unwrap_or_else(|| {
                warn!(run_id = %run_id, "Channel group closed before a terminal phase");
                Phase::Unknown
            });
            if run.advance(phase) {
                info!(run_id = %run_id, phase = %phase, "Run phase changed");
            }

            if run.stream_logs() && streamer.is_none() && registration.group().try_ready() {
                debug!(run_id = %run_id, "Run is loggable, attaching log streamer");
                streamer = Some(LogStreamer::spawn(
                    Arc::clone(&self.cluster),
                    run_id.clone(),
                    self.config.log_buffer_lines,
                ));
            }
        }

        drop(registration);
        if self.config.retention == RetentionPolicy::DeleteOnCompletion {
            if let Some(streamer) = streamer.as_mut() {
                streamer.wait_attached().await;
            }
            self.delete_resource(&run_id).await;
        }

        Ok(self.finish(run, streamer.map(LogStreamer::into_stream)))
    }

    fn finish(&self, run: &mut Run, logs: Option<LogStream>) -> RunOutcome {
        run.mark_ended();
        let phase = run.phase();
        if let Some(metrics) = &self.metrics {
            metrics.record_completed(phase);
        }
        info!(run_id = %run.id(), phase = %phase, "Run finished");

        let ended_at = run.ended_at().unwrap_or_else(Utc::now);
        RunOutcome {
            run_id: run.id().clone(),
            phase,
            started_at: run.started_at().unwrap_or(ended_at),
            ended_at,
            logs,
        }
    }

    fn creation_failed(
        &self,
        run: &mut Run,
        registration: Registration,
        source: ClusterError,
    ) -> RunError {
        let run_id = run.id().clone();
        drop(registration);
        run.mark_ended();
        if let Some(metrics) = &self.metrics {
            metrics.record_creation_failure();
        }
        error!(run_id = %run_id, error = %source, "Resource creation failed");
        RunError::Creation { run_id, source }
    }

    async fn abandon(
        &self,
        run: &mut Run,
        registration: Registration,
        streamer: Option<LogStreamer>,
    ) -> RunError {
        let run_id = run.id().clone();
        drop(registration);
        if let Some(streamer) = streamer {
            streamer.abort();
        }
        self.delete_resource(&run_id).await;
        run.advance(Phase::Unknown);
        run.mark_ended();
        warn!(run_id = %run_id, "Run cancelled");
        RunError::Cancelled { run_id }
    }

    async fn delete_resource(&self, run_id: &RunId) {
        match self.cluster.delete(run_id).await {
            Ok(()) => debug!(run_id = %run_id, "Deleted resource"),
            Err(ClusterError::NotFound(_)) => {
                debug!(run_id = %run_id, "Resource already gone");
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to delete resource"),
        }
    }
}

struct InFlight(Arc<CoordinatorMetrics>);

impl InFlight {
    fn enter(metrics: Arc<CoordinatorMetrics>) -> Self {
        metrics.run_started();
        Self(metrics)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.run_finished();
    }
}
