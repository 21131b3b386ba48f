//! Bitvault CLI - Bitbucket Cloud workspace backup

mod logging;
mod render;
mod settings;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use bitvault_core::application::{
    cancel_channel, BackupOrchestrator, CancelSender, GitSynchronizer, RateLimiter,
};
use bitvault_core::config::BackupConfig;
use bitvault_core::domain::RunOptions;
use bitvault_core::port::id_provider::UuidProvider;
use bitvault_core::port::time_provider::SystemTimeProvider;
use bitvault_infra_fs::LocalStorage;
use bitvault_infra_git::{CliGitBackend, Git2Backend};
use bitvault_infra_http::BitbucketClient;

use settings::Overrides;

#[derive(Parser)]
#[command(name = "bitvault")]
#[command(about = "Back up a Bitbucket Cloud workspace", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: <config_dir>/bitvault/config.toml)
    #[arg(long, global = true, env = "BITVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Workspace to back up
    #[arg(long, global = true)]
    workspace: Option<String>,

    /// Directory backups are written under
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// Also write JSON logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup of the workspace
    Backup(BackupArgs),

    /// Inspect or reset the failure ledger
    Failures {
        #[command(subcommand)]
        action: FailuresCommand,
    },
}

#[derive(Args)]
struct BackupArgs {
    /// Ignore recorded timestamps and fetch everything
    #[arg(long)]
    full: bool,

    /// Enumerate and fetch without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Only back up repositories that failed last time
    #[arg(long, conflicts_with = "include")]
    retry_failed: bool,

    /// Only back up this repository (repeatable)
    #[arg(long = "include", value_name = "SLUG")]
    include: Vec<String>,

    /// Skip this repository (repeatable)
    #[arg(long = "exclude", value_name = "SLUG")]
    exclude: Vec<String>,

    /// Concurrent git workers
    #[arg(long)]
    workers: Option<usize>,

    /// Back up metadata only
    #[arg(long)]
    skip_git: bool,
}

#[derive(Subcommand)]
enum FailuresCommand {
    /// Show repositories whose last attempt failed
    List {
        /// Print the ledger as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget all recorded failures
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{} failed to initialise logging: {:#}", "error:".red().bold(), e);
            return ExitCode::from(render::EXIT_FATAL);
        }
    };

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run aborted");
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(render::EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let workers = match &cli.command {
        Commands::Backup(args) => args.workers,
        Commands::Failures { .. } => None,
    };
    let overrides = Overrides {
        workspace: cli.workspace.clone(),
        storage_root: cli.storage_root.clone(),
        workers,
    };
    let config = settings::load(cli.config.as_deref(), &overrides)?;
    let orchestrator = build_orchestrator(&config)?;

    match cli.command {
        Commands::Backup(args) => {
            let options = RunOptions {
                full: args.full,
                dry_run: args.dry_run,
                retry_failed: args.retry_failed,
                skip_git: args.skip_git,
                include: args.include,
                exclude: args.exclude,
            };

            info!(
                version = bitvault_core::VERSION,
                workspace = %config.workspace,
                storage_root = %config.storage_root.display(),
                "Bitvault starting"
            );

            let (cancel_tx, cancel) = cancel_channel();
            let interrupt = tokio::spawn(cancel_on_interrupt(cancel_tx));

            let report = orchestrator.run(options.clone(), cancel).await;
            interrupt.abort();
            let report = report?;

            render::print_report(&report, options.dry_run);
            Ok(render::exit_code(&report))
        }

        Commands::Failures { action } => match action {
            FailuresCommand::List { json } => {
                let failures = orchestrator.list_failures().await?;
                if json {
                    let ledger: serde_json::Map<String, serde_json::Value> = failures
                        .into_iter()
                        .map(|(slug, record)| -> Result<(String, serde_json::Value)> {
                            Ok((slug, serde_json::to_value(record)?))
                        })
                        .collect::<Result<_>>()?;
                    println!("{}", serde_json::to_string_pretty(&ledger)?);
                } else {
                    render::print_failures(&failures);
                }
                Ok(render::EXIT_OK)
            }
            FailuresCommand::Clear => {
                let cleared = orchestrator.clear_failures().await?;
                println!(
                    "{}",
                    format!("✓ Cleared {} recorded failures", cleared).green().bold()
                );
                Ok(render::EXIT_OK)
            }
        },
    }
}

/// Wire the adapters into the orchestrator
fn build_orchestrator(config: &BackupConfig) -> Result<BackupOrchestrator> {
    let credentials = config.auth.credentials();
    if credentials.is_none() {
        warn!("No credentials configured; only public repositories will be reachable");
    }

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let client = BitbucketClient::new(&config.api_base_url, credentials.clone(), limiter)
        .context("failed to build API client")?;

    let git = GitSynchronizer::new(
        Arc::new(Git2Backend::new(credentials.clone())),
        Some(Arc::new(CliGitBackend::new(credentials))),
        config.workers.git_timeout(),
    );

    Ok(BackupOrchestrator::new(
        config.clone(),
        Arc::new(client),
        Arc::new(LocalStorage::new(&config.storage_root)),
        Arc::new(git),
        Arc::new(SystemTimeProvider),
        Arc::new(UuidProvider),
    ))
}

/// First Ctrl-C cancels the run; in-flight work winds down and state is saved
async fn cancel_on_interrupt(cancel_tx: CancelSender) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupt received, cancelling run");
        eprintln!(
            "{}",
            "Interrupted: finishing in-flight work and saving state...".yellow()
        );
        cancel_tx.cancel();
    }
}
