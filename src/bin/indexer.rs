//! Indexer binary

use clap::{Parser, Subcommand};
use pixel_indexer::common::{config::CONFIG_ENV, format_bytes, parse_duration, Config};
use pixel_indexer::indexer::{snapshot, Canvas};
use pixel_indexer::{IndexerServer, RpcLedger};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pixel-indexer")]
#[command(about = "Pixel canvas ledger indexer with SSE fan-out")]
#[command(version)]
struct Cli {
    /// Config file (overrides $PIXEL_INDEXER_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the indexer and HTTP API
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Ledger JSON-RPC endpoint
        #[arg(long)]
        rpc_url: Option<String>,

        /// Ledger WebSocket endpoint
        #[arg(long)]
        ws_url: Option<String>,

        /// Canvas contract address
        #[arg(long)]
        contract: Option<String>,

        /// Placement event topic0
        #[arg(long)]
        topic: Option<String>,

        /// Contract deployment block
        #[arg(long)]
        origin: Option<u64>,

        /// Snapshot file
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Poll interval without a push subscription (e.g. "500ms", "2s")
        #[arg(long, value_parser = parse_duration)]
        poll_interval: Option<Duration>,
    },

    /// Print a summary of a snapshot file
    Inspect {
        /// Snapshot file (defaults to the configured one)
        path: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(&path.to_string_lossy())?,
        None => Config::load()?,
    };
    Ok(config)
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Serve {
            bind,
            rpc_url,
            ws_url,
            contract,
            topic,
            origin,
            snapshot,
            poll_interval,
        } => {
            // CLI has priority over file and environment
            if let Some(bind) = bind {
                config.api.bind_addr = bind;
            }
            if let Some(rpc_url) = rpc_url {
                config.ledger.rpc_url = rpc_url;
            }
            if ws_url.is_some() {
                config.ledger.ws_url = ws_url;
            }
            if let Some(contract) = contract {
                config.ledger.contract_address = contract;
            }
            if let Some(topic) = topic {
                config.ledger.event_topic = topic;
            }
            if let Some(origin) = origin {
                config.ledger.origin_position = origin;
            }
            if let Some(snapshot) = snapshot {
                config.indexer.snapshot_path = snapshot;
            }
            if let Some(interval) = poll_interval {
                config.indexer.poll_interval_ms = interval.as_millis() as u64;
            }
            config.validate()?;

            tracing::debug!(
                config_file = %std::env::var(CONFIG_ENV).unwrap_or_default(),
                "Configuration loaded"
            );

            let ledger = Arc::new(RpcLedger::new(&config.ledger)?);
            IndexerServer::new(config).serve(ledger).await?;
        }

        Commands::Inspect { path } => {
            let path = path.unwrap_or_else(|| config.indexer.snapshot_path.clone());
            config.indexer.validate()?;
            let canvas = Canvas::new(config.indexer.resolution);

            match snapshot::load(&path, canvas)? {
                Some(state) => {
                    let size = std::fs::metadata(&path)?.len();
                    println!("Snapshot:   {}", path.display());
                    println!("Size:       {}", format_bytes(size));
                    println!("Checkpoint: {}", state.checkpoint);
                    println!("Records:    {}", state.records.len());
                    println!("Resolution: {}", canvas.resolution());
                    println!("Gaps:       {}", state.gaps.len());
                    for gap in &state.gaps {
                        println!("  [{}, {}]", gap.from, gap.to);
                    }
                }
                None => anyhow::bail!("no snapshot at {}", path.display()),
            }
        }
    }

    Ok(())
}
