//! `flowpod run`: one run against the local process backend

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowpod_coordinator::{Orchestrator, OrchestratorError, RunOutcome};
use flowpod_core::{ConfigError, CoordinatorConfig, RetentionPolicy, RetryPolicy, RunConfig};
use flowpod_local::LocalCluster;
use futures::StreamExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("No command given; pass one after the options or use --config")]
    MissingCommand,

    #[error("Failed to read {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task definition in {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

#[derive(Debug)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub name: String,
    pub image: String,
    pub time_limit: Option<Duration>,
    pub retries: u32,
    pub stream_logs: bool,
    pub delete: bool,
    pub command: Vec<String>,
}

impl RunArgs {
    fn task(&self) -> Result<RunConfig, CliError> {
        if let Some(path) = &self.config {
            let content = fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
                path: path.clone(),
                source,
            })?;
            return serde_json::from_str(&content).map_err(|source| CliError::ParseConfig {
                path: path.clone(),
                source,
            });
        }

        if self.command.is_empty() {
            return Err(CliError::MissingCommand);
        }
        let mut task = RunConfig::new(&self.name, &self.image, self.command.iter().cloned());
        if let Some(limit) = self.time_limit {
            task = task.with_time_limit(limit);
        }
        if self.retries > 0 {
            task = task.with_retries(RetryPolicy::OnFailure, self.retries);
        }
        Ok(task)
    }
}

pub async fn run_command(args: RunArgs) -> Result<ExitCode, CliError> {
    let task = args.task()?;
    let mut config = CoordinatorConfig::from_env()?;
    if args.delete {
        config.retention = RetentionPolicy::DeleteOnCompletion;
    }

    let orchestrator = Orchestrator::new(Arc::new(LocalCluster::new()), config)?;
    orchestrator.start().await?;

    let name = task.name.clone();
    orchestrator.add_task(task)?;
    let result = orchestrator.run(&name, Utc::now(), args.stream_logs).await;
    orchestrator.shutdown().await;
    let outcome = result?;

    Ok(if report(outcome).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print the run's output lines and a one-line summary; true if it succeeded
async fn report(mut outcome: RunOutcome) -> bool {
    if let Some(mut logs) = outcome.logs.take() {
        while let Some(line) = logs.next().await {
            println!("{line}");
        }
        if let Err(e) = logs.finish().await {
            eprintln!("warning: {e}");
        }
    }

    let elapsed = (outcome.ended_at - outcome.started_at)
        .to_std()
        .unwrap_or_default();
    eprintln!(
        "{} {} in {}",
        outcome.run_id,
        outcome.phase,
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64))
    );

    outcome.succeeded()
}
