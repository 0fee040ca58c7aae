//! Channel groups: the per-run signal pair
//!
//! Each tracked run owns exactly one group made of a *Ready* signal (fires
//! at most once, when the container has started) and an *Update* queue
//! (one item per observed phase change). The group is split in two halves:
//!
//! - [`ChannelSignaller`], the sending half, lives in the registry and is
//!   used by the event router;
//! - [`ChannelGroup`], the receiving half, is owned by the run coordinator.
//!
//! Sending never blocks. The router only forwards monotonic phase changes,
//! so an update queue holds at most one item per lifecycle phase and the
//! unbounded queue is bounded in practice.

use std::sync::{Mutex, PoisonError};

use flowpod_core::{EventKind, Phase, RunId, WatchEvent};
use tokio::sync::{mpsc, oneshot};

/// Router-side bookkeeping for one identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteState {
    /// Last phase forwarded on the update channel
    pub last_phase: Option<Phase>,
    /// Whether the ready signal has been fired
    pub ready_sent: bool,
}

impl RouteState {
    pub fn is_terminal(&self) -> bool {
        self.last_phase.is_some_and(Phase::is_terminal)
    }
}

/// Signals to deliver for one watch event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteDecision {
    /// Fire the ready signal
    pub ready: bool,
    /// Push this phase on the update channel
    pub update: Option<Phase>,
    /// The event reported a phase earlier than one already forwarded
    pub regression: bool,
}

impl RouteDecision {
    pub fn is_noop(&self) -> bool {
        !self.ready && self.update.is_none()
    }
}

/// Decide which signals an event produces and advance `state`
///
/// Pure: no channels are touched, so the first-loggable and
/// phase-change rules can be tested in isolation.
pub fn route(state: &mut RouteState, kind: EventKind, observed: Phase) -> RouteDecision {
    let mut decision = RouteDecision::default();

    if state.is_terminal() {
        return decision;
    }

    if kind == EventKind::Delete {
        // Deleted before a terminal phase was seen: observation lost
        state.last_phase = Some(Phase::Unknown);
        decision.update = Some(Phase::Unknown);
        return decision;
    }

    if let Some(last) = state.last_phase {
        if observed == last {
            return decision;
        }
        if observed.rank() < last.rank() {
            decision.regression = true;
            return decision;
        }
    }

    if observed.is_loggable() && !state.ready_sent {
        state.ready_sent = true;
        decision.ready = true;
    }

    state.last_phase = Some(observed);
    decision.update = Some(observed);
    decision
}

#[derive(Debug)]
struct SignalState {
    route: RouteState,
    ready: Option<oneshot::Sender<()>>,
}

/// Sending half of a channel group
#[derive(Debug)]
pub struct ChannelSignaller {
    run_id: RunId,
    state: Mutex<SignalState>,
    updates: mpsc::UnboundedSender<Phase>,
}

impl ChannelSignaller {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Apply `event` to this identity's route state and deliver the resulting signals
    ///
    /// Ready is always delivered before the update produced by the same
    /// event, so a coordinator that receives a loggable phase can already
    /// see the ready signal.
    pub fn deliver(&self, event: &WatchEvent) -> RouteDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let decision = route(&mut state.route, event.kind, event.phase);

        if decision.ready {
            if let Some(ready) = state.ready.take() {
                let _ = ready.send(());
            }
        }
        if let Some(phase) = decision.update {
            let _ = self.updates.send(phase);
        }

        decision
    }

    /// Force the identity into `Unknown` unless it is already terminal
    ///
    /// Used when the watch stream is lost. Returns true if a signal was sent.
    pub fn mark_observation_lost(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.route.is_terminal() {
            return false;
        }
        state.route.last_phase = Some(Phase::Unknown);
        self.updates.send(Phase::Unknown).is_ok()
    }

    /// Snapshot of the router-side state
    pub fn route_state(&self) -> RouteState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .route
    }

    /// True once the coordinator has dropped its receiving half
    pub fn is_closed(&self) -> bool {
        self.updates.is_closed()
    }
}

/// Receiving half of a channel group, owned by one run coordinator
#[derive(Debug)]
pub struct ChannelGroup {
    run_id: RunId,
    ready: Option<oneshot::Receiver<()>>,
    ready_fired: bool,
    updates: mpsc::UnboundedReceiver<Phase>,
}

impl ChannelGroup {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Wait for the next phase change
    ///
    /// Returns `None` once the sending half is gone, i.e. the registry
    /// entry was removed by someone else and no router still holds it.
    pub async fn next_update(&mut self) -> Option<Phase> {
        self.updates.recv().await
    }

    /// Non-blocking check of the ready signal; latches once fired
    pub fn try_ready(&mut self) -> bool {
        if self.ready_fired {
            return true;
        }
        if let Some(ready) = self.ready.as_mut() {
            match ready.try_recv() {
                Ok(()) => {
                    self.ready_fired = true;
                    self.ready = None;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => self.ready = None,
            }
        }
        self.ready_fired
    }

    /// Wait for the ready signal
    ///
    /// Returns false if the sending half was dropped without firing.
    pub async fn ready(&mut self) -> bool {
        if self.ready_fired {
            return true;
        }
        match self.ready.take() {
            Some(ready) => {
                self.ready_fired = ready.await.is_ok();
                self.ready_fired
            }
            None => false,
        }
    }
}

/// Create a fresh, connected signaller/group pair for `run_id`
pub fn channel_group(run_id: RunId) -> (ChannelSignaller, ChannelGroup) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    let signaller = ChannelSignaller {
        run_id: run_id.clone(),
        state: Mutex::new(SignalState {
            route: RouteState::default(),
            ready: Some(ready_tx),
        }),
        updates: updates_tx,
    };
    let group = ChannelGroup {
        run_id,
        ready: Some(ready_rx),
        ready_fired: false,
        updates: updates_rx,
    };
    (signaller, group)
}
