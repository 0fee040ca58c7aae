//! Process lifecycle tests for LocalCluster
#![cfg(unix)]

use std::time::Duration;

use flowpod_core::{
    ClusterClient, ClusterError, EventKind, Phase, RetryPolicy, RunConfig, RunId, WatchEvent,
    WatchStream, build_spec,
};
use flowpod_local::{LocalCluster, LocalClusterConfig};
use futures::StreamExt;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn spec_for(config: &RunConfig, id: &str) -> flowpod_core::ResourceSpec {
    build_spec(config, &RunId::parse(id).unwrap()).unwrap()
}

/// Collect events for `run_id` until a terminal or delete event
async fn events_until_done(watch: &mut WatchStream, run_id: &RunId) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(WAIT, watch.next())
            .await
            .expect("watch stalled")
            .expect("watch ended")
            .expect("watch error");
        if &event.run_id != run_id {
            continue;
        }
        let done = event.phase.is_terminal() || event.kind == EventKind::Delete;
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_successful_process_lifecycle() {
    let cluster = LocalCluster::new();
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("echo", "host", ["echo", "Hello World!!!"]);
    let run_id = cluster.create(&spec_for(&config, "echo-1")).await.unwrap();

    let phases: Vec<_> = events_until_done(&mut watch, &run_id)
        .await
        .into_iter()
        .map(|event| (event.kind, event.phase))
        .collect();
    assert_eq!(
        phases,
        vec![
            (EventKind::Add, Phase::Pending),
            (EventKind::Update, Phase::Running),
            (EventKind::Update, Phase::Succeeded),
        ]
    );

    let output: Vec<_> = cluster
        .output_stream(&run_id)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(output, vec!["Hello World!!!"]);
}

#[tokio::test]
async fn test_non_zero_exit_fails() {
    let cluster = LocalCluster::new();
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("exit", "host", ["sh", "-c", "echo oops >&2; exit 3"]);
    let run_id = cluster.create(&spec_for(&config, "exit-1")).await.unwrap();

    let events = events_until_done(&mut watch, &run_id).await;
    assert_eq!(events.last().unwrap().phase, Phase::Failed);
    assert_eq!(cluster.output_of(&run_id).unwrap(), vec!["oops"]);
}

#[tokio::test]
async fn test_missing_binary_fails_with_diagnostic() {
    let cluster = LocalCluster::new();
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("missing", "host", ["/nonexistent/flowpod-binary"]);
    let run_id = cluster.create(&spec_for(&config, "missing-1")).await.unwrap();

    let events = events_until_done(&mut watch, &run_id).await;
    assert_eq!(events.last().unwrap().phase, Phase::Failed);
    assert!(
        events.iter().all(|event| event.phase != Phase::Running),
        "a process that never started must not report Running"
    );
    let output = cluster.output_of(&run_id).unwrap();
    assert_eq!(output.len(), 1);
    assert!(output[0].contains("failed to start"));
}

#[tokio::test]
async fn test_active_deadline_kills_process() {
    let cluster = LocalCluster::new();
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("slow", "host", ["sleep", "30"])
        .with_time_limit(Duration::from_secs(1));
    let run_id = cluster.create(&spec_for(&config, "slow-1")).await.unwrap();

    let events = events_until_done(&mut watch, &run_id).await;
    assert_eq!(events.last().unwrap().phase, Phase::Failed);
    assert_eq!(
        cluster.output_of(&run_id).unwrap(),
        vec!["active deadline exceeded"]
    );
}

#[tokio::test]
async fn test_on_failure_restarts_up_to_limit() {
    let cluster = LocalCluster::with_config(LocalClusterConfig {
        restart_delay: Duration::from_millis(10),
        ..LocalClusterConfig::default()
    });
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("flaky", "host", ["sh", "-c", "echo attempt; exit 1"])
        .with_retries(RetryPolicy::OnFailure, 2);
    let run_id = cluster.create(&spec_for(&config, "flaky-1")).await.unwrap();

    let events = events_until_done(&mut watch, &run_id).await;
    let phases: Vec<_> = events.iter().map(|event| event.phase).collect();
    assert_eq!(phases, vec![Phase::Pending, Phase::Running, Phase::Failed]);
    assert_eq!(
        cluster.output_of(&run_id).unwrap(),
        vec!["attempt", "attempt", "attempt"]
    );
}

#[tokio::test]
async fn test_delete_kills_and_closes_output() {
    let cluster = LocalCluster::new();
    let mut watch = cluster.watch().await.unwrap();

    let config = RunConfig::new("sleeper", "host", ["sh", "-c", "echo started; sleep 30"]);
    let run_id = cluster.create(&spec_for(&config, "sleeper-1")).await.unwrap();

    // Wait until the process is running
    loop {
        let event = timeout(WAIT, watch.next()).await.unwrap().unwrap().unwrap();
        if event.run_id == run_id && event.phase == Phase::Running {
            break;
        }
    }

    let output = cluster.output_stream(&run_id).await.unwrap();
    cluster.delete(&run_id).await.unwrap();

    let event = timeout(WAIT, watch.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(event, WatchEvent::deleted(run_id.clone(), Phase::Running));

    // The follower ends because the log was closed
    timeout(WAIT, output.collect::<Vec<_>>()).await.unwrap();
    assert!(cluster.is_empty());
    assert!(matches!(
        cluster.delete(&run_id).await,
        Err(ClusterError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_and_empty_rejected() {
    let cluster = LocalCluster::new();
    let config = RunConfig::new("dup", "host", ["true"]);
    let spec = spec_for(&config, "dup-1");

    cluster.create(&spec).await.unwrap();
    assert!(matches!(
        cluster.create(&spec).await,
        Err(ClusterError::AlreadyExists(_))
    ));

    let mut empty = spec_for(&config, "dup-2");
    empty.command.clear();
    assert!(matches!(
        cluster.create(&empty).await,
        Err(ClusterError::CreateRejected { .. })
    ));
}
