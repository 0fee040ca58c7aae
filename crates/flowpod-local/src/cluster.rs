//! Host-process cluster backend
//!
//! Each resource is supervised by its own task: the command is spawned as
//! a child process, its stdout and stderr are pumped into an [`OutputLog`],
//! and phase changes are published to every watch subscriber. The image is
//! not used; commands run directly on the host.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowpod_core::{
    ClusterClient, ClusterError, ClusterResult, OutputStream, Phase, ResourceSpec,
    RestartPolicy, RunId, WatchEvent, WatchStream,
};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::output::OutputLog;

/// How long to wait for output pipes to drain after a process exits
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing knobs for [`LocalCluster`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalClusterConfig {
    /// Delay between accepting a resource and starting its process
    pub start_delay: Duration,
    /// Delay before restarting a failed process under `OnFailure`
    pub restart_delay: Duration,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            restart_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct ResourceStatus {
    phase: Phase,
    deleted: bool,
}

#[derive(Debug)]
struct LocalResource {
    spec: ResourceSpec,
    status: Mutex<ResourceStatus>,
    output: Arc<OutputLog>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalResource {
    fn status(&self) -> MutexGuard<'_, ResourceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_id(&self) -> &RunId {
        &self.spec.name
    }
}

#[derive(Debug)]
struct Inner {
    resources: DashMap<RunId, Arc<LocalResource>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent>>>,
    config: LocalClusterConfig,
}

impl Inner {
    fn publish(&self, event: WatchEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Move `resource` to `phase` and notify watchers, unless it was deleted
    fn transition(&self, resource: &LocalResource, phase: Phase) -> bool {
        let mut status = resource.status();
        if status.deleted || status.phase == phase {
            return false;
        }
        status.phase = phase;
        self.publish(WatchEvent::updated(resource.run_id().clone(), phase));
        true
    }

    fn finish(&self, resource: &LocalResource, phase: Phase) {
        if self.transition(resource, phase) {
            info!(run_id = %resource.run_id(), phase = %phase, "Local resource finished");
        }
        resource.output.close();
    }
}

/// [`ClusterClient`] that runs every resource as a local child process
///
/// Cloning is cheap; clones share resources and watchers.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    inner: Arc<Inner>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::with_config(LocalClusterConfig::default())
    }

    pub fn with_config(config: LocalClusterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                resources: DashMap::new(),
                subscribers: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Number of live (not deleted) resources
    pub fn len(&self) -> usize {
        self.inner.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.resources.is_empty()
    }

    /// Current phase of a live resource
    pub fn phase_of(&self, run_id: &RunId) -> Option<Phase> {
        self.inner
            .resources
            .get(run_id)
            .map(|resource| resource.status().phase)
    }

    /// Output captured so far for a live resource
    pub fn output_of(&self, run_id: &RunId) -> Option<Vec<String>> {
        self.inner
            .resources
            .get(run_id)
            .map(|resource| resource.output.lines())
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for LocalCluster {
    async fn create(&self, spec: &ResourceSpec) -> ClusterResult<RunId> {
        let run_id = spec.name.clone();
        if spec.command.is_empty() {
            return Err(ClusterError::CreateRejected {
                run_id,
                reason: "command is empty".to_string(),
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let resource = Arc::new(LocalResource {
            spec: spec.clone(),
            status: Mutex::new(ResourceStatus {
                phase: Phase::Pending,
                deleted: false,
            }),
            output: Arc::new(OutputLog::new()),
            kill: Mutex::new(Some(kill_tx)),
        });

        {
            // Held so a racing delete cannot publish before the add
            let _status = resource.status();
            match self.inner.resources.entry(run_id.clone()) {
                Entry::Occupied(_) => return Err(ClusterError::AlreadyExists(run_id)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&resource));
                }
            }
            self.inner
                .publish(WatchEvent::added(run_id.clone(), Phase::Pending));
        }
        debug!(run_id = %run_id, command = ?spec.command, "Accepted local resource");

        tokio::spawn(supervise(Arc::clone(&self.inner), resource, kill_rx));
        Ok(run_id)
    }

    async fn delete(&self, run_id: &RunId) -> ClusterResult<()> {
        let (_, resource) = self
            .inner
            .resources
            .remove(run_id)
            .ok_or_else(|| ClusterError::NotFound(run_id.clone()))?;

        {
            let mut status = resource.status();
            status.deleted = true;
            self.inner
                .publish(WatchEvent::deleted(run_id.clone(), status.phase));
        }

        let kill = resource
            .kill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        resource.output.close();
        info!(run_id = %run_id, "Deleted local resource");
        Ok(())
    }

    async fn output_stream(&self, run_id: &RunId) -> ClusterResult<OutputStream> {
        let resource = self
            .inner
            .resources
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ClusterError::NotFound(run_id.clone()))?;

        Ok(Box::pin(
            resource.output.follow().map(Ok::<_, ClusterError>),
        ))
    }

    async fn watch(&self) -> ClusterResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(Box::pin(
            UnboundedReceiverStream::new(rx).map(Ok::<_, ClusterError>),
        ))
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    DeadlineExceeded,
    Killed,
}

async fn supervise(
    inner: Arc<Inner>,
    resource: Arc<LocalResource>,
    mut kill: oneshot::Receiver<()>,
) {
    let run_id = resource.run_id().clone();

    if !inner.config.start_delay.is_zero() {
        tokio::select! {
            () = sleep(inner.config.start_delay) => {}
            _ = &mut kill => return,
        }
    }

    let deadline = resource
        .spec
        .active_deadline_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut restarts = 0u32;

    loop {
        let mut child = match spawn(&resource.spec) {
            Ok(child) => child,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to start process");
                resource
                    .output
                    .push(format!("failed to start {:?}: {e}", resource.spec.command));
                inner.finish(&resource, Phase::Failed);
                return;
            }
        };
        if inner.transition(&resource, Phase::Running) {
            info!(run_id = %run_id, pid = ?child.id(), "Local resource running");
        }
        let pumps = pump_output(&mut child, &resource.output);

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            () = wait_deadline(deadline) => Exit::DeadlineExceeded,
            _ = &mut kill => Exit::Killed,
        };

        match exit {
            Exit::Killed => {
                stop(&mut child, pumps).await;
                debug!(run_id = %run_id, "Process killed on delete");
                return;
            }
            Exit::DeadlineExceeded => {
                stop(&mut child, pumps).await;
                warn!(run_id = %run_id, "Active deadline exceeded");
                resource.output.push("active deadline exceeded");
                inner.finish(&resource, Phase::Failed);
                return;
            }
            Exit::Status(Ok(status)) if status.success() => {
                drain(pumps).await;
                inner.finish(&resource, Phase::Succeeded);
                return;
            }
            Exit::Status(result) => {
                drain(pumps).await;
                let reason = match result {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };

                let may_restart = resource.spec.restart_policy == RestartPolicy::OnFailure
                    && restarts < resource.spec.backoff_limit;
                if !may_restart {
                    debug!(run_id = %run_id, reason = %reason, "Process failed");
                    inner.finish(&resource, Phase::Failed);
                    return;
                }

                restarts += 1;
                info!(
                    run_id = %run_id,
                    reason = %reason,
                    restart = restarts,
                    limit = resource.spec.backoff_limit,
                    "Restarting failed process"
                );
                tokio::select! {
                    () = sleep(inner.config.restart_delay) => {}
                    _ = &mut kill => return,
                }
            }
        }
    }
}

fn spawn(spec: &ResourceSpec) -> std::io::Result<Child> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "command is empty",
        ));
    };

    Command::new(program)
        .args(args)
        .env("FLOWPOD_RUN_ID", spec.name.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

fn pump_output(child: &mut Child, output: &Arc<OutputLog>) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, Arc::clone(output))));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, Arc::clone(output))));
    }
    pumps
}

async fn pump<R>(reader: R, output: Arc<OutputLog>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        output.push(line);
    }
}

/// Wait for the pipes to reach EOF; abandon pumps held open by grandchildren
async fn drain(pumps: Vec<JoinHandle<()>>) {
    for mut pump in pumps {
        if timeout(PIPE_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

async fn stop(child: &mut Child, pumps: Vec<JoinHandle<()>>) {
    let _ = child.start_kill();
    let _ = child.wait().await;
    drain(pumps).await;
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
