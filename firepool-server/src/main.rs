//! Entry point for the `firepool` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use firepool_core::Config;
use firepool_guest::agent::DEFAULT_WORK_DIR;
use firepool_guest::{
    default_metadata_url, MetadataClient, RunnerAgent, DEFAULT_GROUP, DEFAULT_OWNER, DEFAULT_RETRY_INTERVAL,
};
use firepool_server::Server;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/firepool/config.toml";

#[derive(Parser)]
#[command(name = "firepool", version, about = "Ephemeral Firecracker CI runner orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pool controller and status API on the host.
    Serve {
        #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run one CI job inside a runner VM.
    Runner {
        /// Base URL of the guest metadata service.
        #[arg(long)]
        metadata_url: Option<String>,
        #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL.as_secs())]
        retry_interval_secs: u64,
        #[arg(long)]
        gitlab_runner: Option<PathBuf>,
        #[arg(long)]
        executor: Option<String>,
        #[arg(long, default_value = DEFAULT_WORK_DIR)]
        work_dir: PathBuf,
        /// User to run gitlab-runner as; empty keeps the agent's own user.
        #[arg(long, default_value = DEFAULT_OWNER)]
        owner: String,
        /// Group to run gitlab-runner as; empty uses the owner's primary group.
        #[arg(long, default_value = DEFAULT_GROUP)]
        group: String,
        #[arg(long, short, default_value = "info")]
        log_level: String,
    },
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
            }
        };
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
            }
        };
        tokio::select! {
            () = ctrl_c => info!("received SIGINT, shutting down"),
            () = terminate => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve { config: PathBuf::from(DEFAULT_CONFIG_PATH) });

    let code = match command {
        Command::Serve { config } => serve(config).await,
        Command::Runner { metadata_url, retry_interval_secs, gitlab_runner, executor, work_dir, owner, group, log_level } => {
            init_tracing(&log_level);
            let mut agent = RunnerAgent::default().with_work_dir(work_dir);
            if !owner.is_empty() {
                agent = agent.with_owner(owner);
            }
            if !group.is_empty() {
                agent = agent.with_group(group);
            }
            if let Some(path) = gitlab_runner {
                agent = agent.with_gitlab_runner(path);
            }
            if let Some(executor) = executor {
                agent = agent.with_executor(executor);
            }
            let url = metadata_url.unwrap_or_else(default_metadata_url);
            run_guest(agent, url, Duration::from_secs(retry_interval_secs)).await
        }
    };
    std::process::exit(code);
}

async fn serve(path: PathBuf) -> i32 {
    let config = match Config::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            init_tracing("info");
            tracing::error!(path = %path.display(), error = %e, "failed to load configuration");
            return 1;
        }
    };
    init_tracing(&config.log_level);
    info!(path = %path.display(), pools = config.pools.len(), "configuration loaded");

    let server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to build server");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    if let Err(e) = server.run(cancel).await {
        tracing::error!(error = %e, "server error");
        return 1;
    }
    0
}

async fn run_guest(agent: RunnerAgent, url: String, retry: Duration) -> i32 {
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let client = match MetadataClient::new(url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build metadata client");
            return 1;
        }
    };
    info!(url = %url, "waiting for runner metadata");
    let metadata = match client.wait_for_metadata(retry, &cancel).await {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "no runner metadata");
            return 1;
        }
    };
    info!(runner_name = %metadata.runner_name, pool = %metadata.pool_name, "runner metadata received");

    match agent.run_once(&metadata, &cancel).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "runner failed");
            1
        }
    }
}
