use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

mod run;

use run::{RunArgs, run_command};

#[derive(Parser, Debug)]
#[command(name = "flowpod", version)]
#[command(about = "Run tasks as local processes and follow them to completion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one run of a task and print its output
    Run {
        /// Task definition as JSON (overrides the inline options below)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Task name
        #[arg(long, default_value = "adhoc")]
        name: String,
        /// Image recorded on the resource (not used by the local backend)
        #[arg(long, default_value = "host")]
        image: String,
        /// Maximum runtime, e.g. "30s" or "5m"
        #[arg(long, value_parser = humantime::parse_duration)]
        time_limit: Option<Duration>,
        /// Restart a failing process up to this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Do not stream output
        #[arg(long)]
        no_logs: bool,
        /// Delete the resource once the run is terminal
        #[arg(long)]
        delete: bool,
        /// Command to execute
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize JSON logging once.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            name,
            image,
            time_limit,
            retries,
            no_logs,
            delete,
            command,
        } => {
            let args = RunArgs {
                config,
                name,
                image,
                time_limit,
                retries,
                stream_logs: !no_logs,
                delete,
                command,
            };
            match run_command(args).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "Run command failed");
                    eprintln!("error: {e}");
                    ExitCode::from(2)
                }
            }
        }
    }
}
