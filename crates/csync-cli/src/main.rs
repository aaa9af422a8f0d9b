use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use csync_sync::{report_runs_markdown, RunMode, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "csync")]
#[command(about = "Reconcile a master catalog export with a slave store")]
struct Cli {
    /// Workspace holding master.json, slave.json, sync.yaml and reports/.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match, merge and apply changes through the configured transports.
    Sync {
        /// Create slave records for unmatched master records.
        #[arg(long)]
        auto_create: bool,
        /// Also apply the non-identity part of problematic updates.
        #[arg(long)]
        include_problematic: bool,
    },
    /// Match and merge only; nothing is written to either side.
    Plan,
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn config(workspace: Option<PathBuf>) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    if let Some(root) = workspace {
        config.master_path = root.join("master.json");
        config.slave_path = root.join("slave.json");
        config.workspace_root = root;
    }
    config
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync {}: run_id={} phases={} failures={} reports={}",
        summary.mode.as_str(),
        summary.run_id,
        summary.phases.len(),
        summary.failure_count(),
        summary.reports_dir
    );
}

async fn run(config: SyncConfig, mode: RunMode) -> Result<()> {
    let pipeline = SyncPipeline::new(config)?;
    let interrupt = pipeline.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping before the next update");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let summary = pipeline.run_once(mode).await?;
    print_summary(&summary);
    if let Some(aborted) = &summary.aborted {
        bail!("{} phase aborted: {}", aborted.phase, aborted.error);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Plan) {
        Commands::Sync {
            auto_create,
            include_problematic,
        } => {
            let mut config = config(cli.workspace);
            config.auto_create |= auto_create;
            config.include_problematic |= include_problematic;
            run(config, RunMode::Apply).await?;
        }
        Commands::Plan => run(config(cli.workspace), RunMode::Plan).await?,
        Commands::Report { runs } => {
            let root = config(cli.workspace).workspace_root;
            println!("{}", report_runs_markdown(runs, Some(root))?);
        }
    }

    Ok(())
}
