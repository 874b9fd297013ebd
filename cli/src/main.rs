//! chainscan CLI: run indexing workers, execute backfill scripts and
//! inspect scan ranges.
//!
//! Usage:
//! ```bash
//! chainscan run --rpc-url http://localhost:3050 --workers 4
//! chainscan backfill
//! chainscan ranges
//! chainscan info
//! ```
//!
//! Settings are read from `.env`, then `CHAINSCAN_*` environment variables,
//! then flags.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use chainscan_core::backfill::BackfillRunner;
use chainscan_core::error::IndexerError;
use chainscan_core::indexer::IndexerConfig;
use chainscan_core::scheduler::coverage_fault;
use chainscan_core::store::{RangeStore, ScriptStore};
use chainscan_evm::{
    default_scripts, run_indexer, IndexerBuilder, JsonRpcClient, RpcClientConfig, Shutdown,
    TransferDecoder,
};
use chainscan_storage::{PostgresOptions, PostgresStorage};

use logging::{init_metrics, init_tracing, LogConfig, MetricsConfig};

#[derive(Parser)]
#[command(name = "chainscan", version, about = "Reorg-safe L2 chain indexer")]
struct Cli {
    /// PostgreSQL connection URL.
    #[arg(long, env = "CHAINSCAN_DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, env = "CHAINSCAN_DB_MAX_CONNECTIONS", default_value_t = 10, global = true)]
    db_max_connections: u32,

    #[arg(long, env = "CHAINSCAN_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long, env = "CHAINSCAN_LOG_JSON", global = true)]
    log_json: bool,

    /// OTLP gRPC endpoint for metrics export; metrics are off when unset.
    #[arg(long, env = "CHAINSCAN_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    #[arg(long, env = "CHAINSCAN_METRICS_INTERVAL_SECS", default_value_t = 15, global = true)]
    metrics_interval_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start workers and the finality poller.
    Run(RunArgs),
    /// Execute pending backfill scripts.
    Backfill {
        /// Only list registered scripts and their status.
        #[arg(long)]
        list: bool,
    },
    /// Show scan ranges, the frontier and any pending reorg hold.
    Ranges,
    /// Print version and default configuration.
    Info,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, env = "CHAINSCAN_RPC_URL")]
    rpc_url: String,

    /// JSON file with an `IndexerConfig`; flags override its values.
    #[arg(long, env = "CHAINSCAN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHAINSCAN_WORKER_ID")]
    worker_id: Option<String>,

    #[arg(long, env = "CHAINSCAN_FROM_BLOCK")]
    from_block: Option<u64>,

    #[arg(long, env = "CHAINSCAN_TO_BLOCK")]
    to_block: Option<u64>,

    #[arg(long, env = "CHAINSCAN_RANGE_SIZE")]
    range_size: Option<u64>,

    #[arg(long, env = "CHAINSCAN_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "CHAINSCAN_MAX_REORG_DEPTH")]
    max_reorg_depth: Option<u64>,

    #[arg(long, env = "CHAINSCAN_RANGE_LIVENESS_TIMEOUT_SECS")]
    range_liveness_timeout_secs: Option<u64>,

    #[arg(long, env = "CHAINSCAN_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
}

impl RunArgs {
    fn indexer_config(&self) -> Result<IndexerConfig, IndexerError> {
        let base = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    IndexerError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    IndexerError::Config(format!("invalid config {}: {e}", path.display()))
                })?
            }
            None => IndexerConfig::default(),
        };

        let mut builder = IndexerBuilder::from_config(base);
        if let Some(id) = &self.worker_id {
            builder = builder.worker_id(id.clone());
        }
        if let Some(n) = self.from_block {
            builder = builder.from_block(n);
        }
        if let Some(n) = self.to_block {
            builder = builder.to_block(n);
        }
        if let Some(n) = self.range_size {
            builder = builder.range_size(n);
        }
        if let Some(n) = self.workers {
            builder = builder.workers(n);
        }
        if let Some(n) = self.max_reorg_depth {
            builder = builder.max_reorg_depth(n);
        }
        if let Some(n) = self.range_liveness_timeout_secs {
            builder = builder.range_liveness_timeout_secs(n);
        }
        if let Some(n) = self.poll_interval_ms {
            builder = builder.poll_interval_ms(n);
        }
        let config = builder.build_config();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..LogConfig::default()
    });

    let meter_provider = init_metrics(&MetricsConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        export_interval_secs: cli.metrics_interval_secs,
    })?;

    let result = match &cli.command {
        Command::Run(args) => cmd_run(&cli, args).await,
        Command::Backfill { list } => cmd_backfill(&cli, *list).await,
        Command::Ranges => cmd_ranges(&cli).await,
        Command::Info => cmd_info(),
    };

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Metrics exporter shutdown failed");
        }
    }
    result
}

async fn connect(cli: &Cli, write_chunk_size: usize) -> anyhow::Result<Arc<PostgresStorage>> {
    let url = cli
        .database_url
        .as_deref()
        .context("CHAINSCAN_DATABASE_URL (or --database-url) is required")?;
    let opts = PostgresOptions {
        max_connections: cli.db_max_connections,
        write_chunk_size,
        ..PostgresOptions::default()
    };
    Ok(Arc::new(PostgresStorage::connect(url, opts).await?))
}

async fn cmd_run(cli: &Cli, args: &RunArgs) -> anyhow::Result<()> {
    let config = args.indexer_config()?;
    let store = connect(cli, config.write_chunk_size).await?;
    let client = Arc::new(JsonRpcClient::new(&args.rpc_url, RpcClientConfig::default())?);

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = trigger.send(true);
        }
    });

    tracing::info!(rpc = %args.rpc_url, workers = config.workers, "Starting indexer");
    run_indexer(config, store, client, Arc::new(TransferDecoder), shutdown).await?;
    Ok(())
}

async fn cmd_backfill(cli: &Cli, list: bool) -> anyhow::Result<()> {
    let store = connect(cli, PostgresOptions::default().write_chunk_size).await?;

    if list {
        for script in store.scripts().await? {
            println!(
                "{:<32} {:<10} {}",
                script.name,
                script.status.to_string(),
                script.updated_at.to_rfc3339()
            );
        }
        return Ok(());
    }

    let mut runner = BackfillRunner::new(store.clone());
    for script in default_scripts(store.clone()) {
        runner.register(script);
    }
    let report = runner.execute_pending().await?;
    println!("completed: {:?}", report.completed);
    println!("outdated:  {:?}", report.outdated);
    println!("skipped:   {:?}", report.skipped);
    Ok(())
}

async fn cmd_ranges(cli: &Cli) -> anyhow::Result<()> {
    let store = connect(cli, PostgresOptions::default().write_chunk_size).await?;
    let ranges = store.ranges().await?;

    println!("{:>12} {:>12}  {:<10} {}", "FROM", "TO", "STATUS", "OWNER");
    for r in &ranges {
        println!(
            "{:>12} {:>12}  {:<10} {}",
            r.from,
            r.to,
            r.status.as_str(),
            r.owner.as_deref().unwrap_or("-")
        );
    }

    let frontier = store.frontier().await?;
    println!("\nfrontier: {}", frontier.map_or("-".into(), |n| n.to_string()));
    if let Some(hold) = store.pending_hold().await? {
        println!("reorg hold from block {hold}");
    }
    if let (Some(first), Some(end)) = (ranges.iter().map(|r| r.from).min(), frontier) {
        match coverage_fault(&ranges, first, end) {
            Some(n) => println!("first block not covered by a completed range: {n}"),
            None => println!("coverage: contiguous [{first}, {end})"),
        }
    }
    Ok(())
}

fn cmd_info() -> anyhow::Result<()> {
    println!("chainscan v{}", env!("CARGO_PKG_VERSION"));
    println!("  Storage backends: memory (library), PostgreSQL (CLI)");
    println!("  Finality: sealed → committed → proven → executed");
    println!("\nDefault configuration:");
    println!("{}", serde_json::to_string_pretty(&IndexerConfig::default())?);
    Ok(())
}
