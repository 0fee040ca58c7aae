//! The run record and its read-only snapshot

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::{identity::RunId, phase::Phase, run_config::RunConfig};

/// Point-in-time view of a run for external reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub task: String,
    pub phase: Phase,
    pub execution_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stream_logs: bool,
}

/// One execution attempt of a configured task
///
/// A run is owned by the coordinator driving it. Observers get a
/// [`watch::Receiver`] via [`Run::observe`] and see every transition
/// without being able to mutate anything.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    config: Arc<RunConfig>,
    execution_time: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    stream_logs: bool,
    phase: Phase,
    status: watch::Sender<RunSnapshot>,
}

impl Run {
    /// Create a run of `config` with a freshly generated identity
    pub fn new(config: Arc<RunConfig>, execution_time: DateTime<Utc>, stream_logs: bool) -> Self {
        let id = RunId::generate(&config.name);
        Self::with_id(id, config, execution_time, stream_logs)
    }

    /// Create a run with a caller-chosen identity
    pub fn with_id(
        id: RunId,
        config: Arc<RunConfig>,
        execution_time: DateTime<Utc>,
        stream_logs: bool,
    ) -> Self {
        let snapshot = RunSnapshot {
            run_id: id.clone(),
            task: config.name.clone(),
            phase: Phase::Pending,
            execution_time,
            started_at: None,
            ended_at: None,
            stream_logs,
        };
        let (status, _) = watch::channel(snapshot);

        Self {
            id,
            config,
            execution_time,
            started_at: None,
            ended_at: None,
            stream_logs,
            phase: Phase::Pending,
            status,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn config(&self) -> &Arc<RunConfig> {
        &self.config
    }

    /// Logical time the run represents, distinct from when it started
    pub fn execution_time(&self) -> DateTime<Utc> {
        self.execution_time
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn stream_logs(&self) -> bool {
        self.stream_logs
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Subscribe to snapshots of this run
    pub fn observe(&self) -> watch::Receiver<RunSnapshot> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.status.borrow().clone()
    }

    /// Record the wall-clock start; returns false if already started
    pub fn mark_started(&mut self) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(Utc::now());
        self.publish();
        true
    }

    /// Advance to `phase`, ignoring regressions and changes after a terminal phase
    ///
    /// Returns true if the phase changed.
    pub fn advance(&mut self, phase: Phase) -> bool {
        if !self.phase.can_transition_to(phase) {
            return false;
        }
        self.phase = phase;
        self.publish();
        true
    }

    /// Record the end time; it is always strictly after the start time
    pub fn mark_ended(&mut self) {
        let now = Utc::now();
        let ended = match self.started_at {
            Some(start) if now <= start => start + TimeDelta::microseconds(1),
            _ => now,
        };
        self.ended_at = Some(ended);
        self.publish();
    }

    fn publish(&self) {
        self.status.send_modify(|snapshot| {
            snapshot.phase = self.phase;
            snapshot.started_at = self.started_at;
            snapshot.ended_at = self.ended_at;
        });
    }
}
