use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use cfp_sync::{report_recent_markdown, PipelineConfig, ReconcilePipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status when invalid canonical records stopped the run from writing.
const EXIT_BLOCKED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "cfp")]
#[command(about = "Reconcile conference CFP deadlines from multiple sources")]
struct Cli {
    /// Workspace holding sources.yaml, data/, cache/ and reports/.
    #[arg(long, global = true, env = "CFP_ROOT")]
    root: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `cfp_sync=trace`. Defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Run(RunArgs),
    /// Run reconciliation on the configured cron schedule until interrupted.
    Schedule(RunArgs),
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    /// Skip link liveness checks.
    #[arg(long)]
    skip_links: bool,
    /// Compute everything, write nothing.
    #[arg(long)]
    dry_run: bool,
    /// Reference date for archiving (YYYY-MM-DD).
    #[arg(long)]
    today: Option<NaiveDate>,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn pipeline_config(root: Option<PathBuf>, args: &RunArgs) -> PipelineConfig {
    let mut config = PipelineConfig::from_env();
    if let Some(root) = root {
        config.workspace_root = root;
    }
    config.skip_links |= args.skip_links;
    config.dry_run |= args.dry_run;
    config.today = args.today.or(config.today);
    config
}

async fn run(config: PipelineConfig) -> Result<ExitCode> {
    let summary = ReconcilePipeline::new(config)?.run_once().await?;
    println!(
        "run complete: run_id={} inserted={} merged={} archived={} flagged={} rejected={} written={}{}",
        summary.run_id,
        summary.counts.inserted,
        summary.counts.merged,
        summary.newly_archived,
        summary.counts.flagged,
        summary.rejected + summary.counts.invalid,
        summary.store_written,
        summary
            .reports_dir
            .as_deref()
            .map(|dir| format!(" reports={dir}"))
            .unwrap_or_default(),
    );
    if summary.blocked {
        eprintln!(
            "write blocked: {} canonical record(s) failed validation",
            summary.blocking.len()
        );
        return Ok(ExitCode::from(EXIT_BLOCKED));
    }
    Ok(ExitCode::SUCCESS)
}

async fn schedule(mut config: PipelineConfig) -> Result<ExitCode> {
    config.scheduler_enabled = true;
    let cron = config.sync_cron.clone();
    let pipeline = ReconcilePipeline::new(config)?;
    let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
        return Ok(ExitCode::SUCCESS);
    };
    scheduler.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    scheduler.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(pipeline_config(cli.root, &args)).await,
        Commands::Schedule(args) => schedule(pipeline_config(cli.root, &args)).await,
        Commands::Report { runs } => {
            let root = cli.root.or_else(|| Some(PipelineConfig::from_env().workspace_root));
            print!("{}", report_recent_markdown(runs, root)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
