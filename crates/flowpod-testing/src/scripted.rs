//! # Scripted Cluster
//!
//! A [`ClusterClient`] whose watch notifications are either pushed by the
//! test ([`ScriptedCluster::emit`]) or replayed from a per-resource phase
//! script after creation. Every notification and output attachment is
//! recorded in a journal so tests can assert on ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use flowpod_core::{
    ClusterClient, ClusterError, ClusterResult, OutputStream, Phase, ResourceSpec, RunId,
    WatchEvent, WatchStream,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

type PhaseScript = Arc<dyn Fn(&ResourceSpec) -> Vec<Phase> + Send + Sync>;
type OutputScript = Arc<dyn Fn(&ResourceSpec) -> Vec<String> + Send + Sync>;

/// Something the cluster did, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// A watch notification was published
    Emitted(WatchEvent),
    /// An error item was published on the watch stream
    WatchError(String),
    /// A caller attached to a resource's output
    OutputAttached(RunId),
}

#[derive(Debug)]
struct ScriptedResource {
    spec: ResourceSpec,
    phase: Phase,
}

#[derive(Default)]
struct State {
    resources: HashMap<RunId, ScriptedResource>,
    subscribers: Vec<mpsc::UnboundedSender<ClusterResult<WatchEvent>>>,
    created: Vec<RunId>,
    deleted: Vec<RunId>,
    journal: Vec<JournalEntry>,
}

impl State {
    fn publish(&mut self, event: WatchEvent) {
        if let Some(resource) = self.resources.get_mut(&event.run_id) {
            resource.phase = event.phase;
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(Ok(event.clone())).is_ok());
        debug!(run_id = %event.run_id, kind = %event.kind, phase = %event.phase, "Scripted event");
        self.journal.push(JournalEntry::Emitted(event));
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic in-process cluster for tests
///
/// Creating a resource publishes `Add(Pending)` before `create` returns;
/// scripted phases follow from a background task, one every step delay.
#[derive(Clone)]
pub struct ScriptedCluster {
    script: Option<PhaseScript>,
    output: Option<OutputScript>,
    broken_output: Option<ClusterError>,
    creation_failure: Option<ClusterError>,
    step_delay: Duration,
    state: Arc<Mutex<State>>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self {
            script: None,
            output: None,
            broken_output: None,
            creation_failure: None,
            step_delay: Duration::from_millis(5),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Phases each created resource moves through after `Pending`
    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&ResourceSpec) -> Vec<Phase> + Send + Sync + 'static,
    {
        self.script = Some(Arc::new(script));
        self
    }

    /// Output lines each resource produces
    pub fn with_output<F>(mut self, output: F) -> Self
    where
        F: Fn(&ResourceSpec) -> Vec<String> + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(output));
        self
    }

    /// End every output stream with `error` after its lines
    pub fn with_broken_output(mut self, error: ClusterError) -> Self {
        self.broken_output = Some(error);
        self
    }

    /// Reject every creation request with `error`
    pub fn fail_creation(mut self, error: ClusterError) -> Self {
        self.creation_failure = Some(error);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Publish a notification to every watcher
    pub fn emit(&self, event: WatchEvent) {
        lock(&self.state).publish(event);
    }

    /// Publish an error item to every watcher
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = lock(&self.state);
        state.subscribers.retain(|subscriber| {
            subscriber
                .send(Err(ClusterError::Watch(message.clone())))
                .is_ok()
        });
        state.journal.push(JournalEntry::WatchError(message));
    }

    /// End every open watch stream
    pub fn close_watch(&self) {
        lock(&self.state).subscribers.clear();
    }

    /// Number of watch subscriptions still open
    pub fn watcher_count(&self) -> usize {
        lock(&self.state)
            .subscribers
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }

    /// Identities created so far, in creation order
    pub fn created(&self) -> Vec<RunId> {
        lock(&self.state).created.clone()
    }

    /// Identities deleted so far, in deletion order
    pub fn deleted(&self) -> Vec<RunId> {
        lock(&self.state).deleted.clone()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.state).journal.clone()
    }

    /// Last phase published for a live resource
    pub fn phase_of(&self, run_id: &RunId) -> Option<Phase> {
        lock(&self.state)
            .resources
            .get(run_id)
            .map(|resource| resource.phase)
    }

    fn play(&self, run_id: RunId, phases: Vec<Phase>) {
        let state = Arc::clone(&self.state);
        let step_delay = self.step_delay;

        tokio::spawn(async move {
            for phase in phases {
                tokio::time::sleep(step_delay).await;
                let mut guard = lock(&state);
                if !guard.resources.contains_key(&run_id) {
                    return;
                }
                guard.publish(WatchEvent::updated(run_id.clone(), phase));
            }
        });
    }
}

impl Default for ScriptedCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for ScriptedCluster {
    async fn create(&self, spec: &ResourceSpec) -> ClusterResult<RunId> {
        if let Some(error) = &self.creation_failure {
            return Err(error.clone());
        }

        let run_id = spec.name.clone();
        {
            let mut state = lock(&self.state);
            if state.resources.contains_key(&run_id) {
                return Err(ClusterError::AlreadyExists(run_id));
            }
            state.resources.insert(
                run_id.clone(),
                ScriptedResource {
                    spec: spec.clone(),
                    phase: Phase::Pending,
                },
            );
            state.created.push(run_id.clone());
            state.publish(WatchEvent::added(run_id.clone(), Phase::Pending));
        }

        if let Some(script) = &self.script {
            self.play(run_id.clone(), script(spec));
        }
        Ok(run_id)
    }

    async fn delete(&self, run_id: &RunId) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let resource = state
            .resources
            .remove(run_id)
            .ok_or_else(|| ClusterError::NotFound(run_id.clone()))?;
        state.deleted.push(run_id.clone());
        state.publish(WatchEvent::deleted(run_id.clone(), resource.phase));
        Ok(())
    }

    async fn output_stream(&self, run_id: &RunId) -> ClusterResult<OutputStream> {
        let mut state = lock(&self.state);
        let resource = state
            .resources
            .get(run_id)
            .ok_or_else(|| ClusterError::NotFound(run_id.clone()))?;

        let mut items: Vec<ClusterResult<String>> = self
            .output
            .as_ref()
            .map(|output| output(&resource.spec))
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect();
        if let Some(error) = &self.broken_output {
            items.push(Err(error.clone()));
        }

        state
            .journal
            .push(JournalEntry::OutputAttached(run_id.clone()));
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn watch(&self) -> ClusterResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).subscribers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
