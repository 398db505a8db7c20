//! Gatehouse binary: bootstraps a cluster around this node and serves the
//! HTTP surface.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use gatehouse::config::{AppConfig, ConfigOverrides};
use gatehouse::consensus::InMemoryCluster;
use gatehouse::routes;
use gatehouse::state::AppState;
use portcullis_common::CodeDigest;

/// Portcullis Gatehouse - code identity registry and node admission
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/gatehouse.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Founding code image; its SHA-256 becomes the first accepted identity
    #[arg(long, conflicts_with = "founding_digest")]
    founding_code: Option<PathBuf>,

    /// Hex digest of the founding code (overrides config)
    #[arg(long, env = "FOUNDING_DIGEST")]
    founding_digest: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("🏰 Starting Portcullis Gatehouse v{}", env!("CARGO_PKG_VERSION"));

    let overrides = ConfigOverrides {
        listen: args.listen.clone(),
        founding_digest: args.founding_digest.clone(),
    };
    let config = AppConfig::load(&args.config, &overrides)?;
    info!("📋 Configuration loaded from {}", args.config);

    let founding = founding_digest(&args, &config)?;
    let (cluster, founder) =
        InMemoryCluster::bootstrap(config.cluster.options(), config.advertise_addr(), founding);
    info!(node_id = %founder, code = %founding, "👑 Founded cluster");

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config, founder, Arc::new(cluster))?;
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    info!("🚀 Gatehouse listening on {}", listen_addr);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("👋 Gatehouse shutdown complete");
    Ok(())
}

/// Founding identity from `--founding-code`, else from the digest setting
fn founding_digest(args: &Args, config: &AppConfig) -> Result<CodeDigest> {
    if let Some(ref path) = args.founding_code {
        let image = std::fs::read(path)
            .with_context(|| format!("Failed to read founding code {}", path.display()))?;
        return Ok(CodeDigest::measure(&image));
    }

    match config.founding_digest()? {
        Some(digest) => Ok(digest),
        None => bail!("No founding code identity: pass --founding-code or --founding-digest"),
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
