use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikisync_core::Phase;
use wikisync_storage::PgStore;
use wikisync_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wikisync")]
#[command(about = "Incremental mirror of a wiki's GraphQL catalog")]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full metadata scan, detail and deep hydration pass
    Sync,
    /// Run a single phase against the current checkpoint run
    Phase {
        #[arg(value_enum)]
        phase: PhaseArg,
    },
    /// Queue pages for a detail re-check by URL
    Seed {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Dirty-queue summary, optionally verifying version chains
    Status {
        #[arg(long = "check-page")]
        check_pages: Vec<i64>,
    },
    /// Apply database migrations
    Migrate,
    /// Run syncs on the configured cron until interrupted
    Schedule,
    /// Reference edges extracted from stored page sources, one JSON line per page
    Refgraph {
        #[arg(required = true)]
        page_ids: Vec<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    A,
    B,
    C,
}

impl From<PhaseArg> for Phase {
    fn from(arg: PhaseArg) -> Self {
        match arg {
            PhaseArg::A => Phase::A,
            PhaseArg::B => Phase::B,
            PhaseArg::C => Phase::C,
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// First Ctrl-C stops the pipeline between batches; checkpoints keep what finished.
fn cancel_on_ctrl_c(pipeline: &SyncPipeline) {
    let token = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight batches");
            token.cancel();
        }
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::new(config).await?;
            cancel_on_ctrl_c(&pipeline);
            let summary = pipeline.run_once().await?;
            print_json(&summary)?;
        }
        Commands::Phase { phase } => {
            let pipeline = SyncPipeline::new(config).await?;
            cancel_on_ctrl_c(&pipeline);
            let checkpoints = pipeline.open_checkpoints().await?;
            match Phase::from(phase) {
                Phase::A => print_json(&pipeline.run_phase_a(&checkpoints).await?)?,
                Phase::B => print_json(&pipeline.run_phase_b(&checkpoints).await?)?,
                Phase::C => print_json(&pipeline.run_phase_c(&checkpoints).await?)?,
            }
            if !pipeline.cancel_token().is_cancelled() {
                checkpoints.finish().await?;
            }
        }
        Commands::Seed { urls } => {
            let pipeline = SyncPipeline::new(config).await?;
            let report = pipeline.seed_urls(&urls).await?;
            print_json(&report)?;
        }
        Commands::Status { check_pages } => {
            let pipeline = SyncPipeline::new(config).await?;
            print_json(&pipeline.queue_summary().await?)?;
            if !check_pages.is_empty() {
                print_json(&pipeline.check_pages(&check_pages).await?)?;
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config).await?);
            let mut scheduler = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler not configured")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduled sync running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            pipeline.cancel_token().cancel();
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Refgraph { page_ids } => {
            let pipeline = SyncPipeline::new(config).await?;
            let pool = pipeline.reference_graph_pool();
            let graphs = pool.compute(page_ids).await?;
            pool.shutdown().await;
            for graph in graphs {
                println!("{}", serde_json::to_string(&graph)?);
            }
        }
    }

    Ok(())
}
