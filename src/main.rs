//! Nano Work Cache
//!
//! Caching work_generate accelerator in front of a Nano node.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Nano Work Cache                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  RPC Server  │───▶│  Work Cache  │───▶│   Node RPC   │       │
//! │  │  (:7176)     │    │  (engine)    │    │   Adapter    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐            │                                   │
//! │  │   Metrics    │◀───────────┘                                   │
//! │  └──────────────┘                                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nano_work_cache::engine::WorkCacheConfig;
use nano_work_cache::server::{self, RpcServer, ServerConfig};
use nano_work_cache::{FailurePolicy, NodeRpcAdapter, NodeRpcConfig, WorkCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Nano Work Cache - proof-of-work caching in front of a Nano node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node RPC URL
    #[arg(long, env = "NODE_RPC_URL")]
    node_rpc_url: String,

    /// RPC listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:7176")]
    listen_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9176")]
    metrics_addr: String,

    /// Cache file; persistence is disabled when absent
    #[arg(long, env = "PERSIST_FILE")]
    persist_file: Option<PathBuf>,

    /// Pregeneration workers
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    worker_count: usize,

    /// Maximum concurrent work requests to the node
    #[arg(long, env = "MAX_OUTSTANDING", default_value = "8")]
    max_outstanding: usize,

    /// Evict entries older than this many days (0 keeps everything)
    #[arg(long, env = "MAX_CACHE_AGE_DAYS", default_value = "0")]
    max_cache_age_days: u64,

    /// Pregeneration queue capacity
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "5000")]
    queue_capacity: usize,

    /// Maximum concurrent RPC handlers
    #[arg(long, env = "MAX_ACTIVE_HANDLERS", default_value = "200")]
    max_active_handlers: usize,

    /// Node request timeout in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value = "60")]
    rpc_timeout_secs: u64,

    /// Remove the in-progress marker when a node work call fails
    #[arg(long, env = "ROLLBACK_ON_ERROR")]
    rollback_on_error: bool,

    /// Do not pregenerate from balance and block actions
    #[arg(long, env = "DISABLE_PREGENERATION")]
    disable_pregeneration: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn work_cache_config(&self) -> WorkCacheConfig {
        let mut config = WorkCacheConfig::new(
            self.worker_count,
            self.max_outstanding,
            self.max_cache_age_days,
        );
        config.persist_path = self.persist_file.clone();
        config.pregen.capacity = self.queue_capacity;
        if self.rollback_on_error {
            config.resolver.failure_policy = FailurePolicy::Rollback;
        }
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Nano Work Cache");
    info!("  Node RPC: {}", args.node_rpc_url);
    info!("  Listen: {}", args.listen_addr);
    info!("  Persist file: {:?}", args.persist_file);
    info!("  Workers: {}", args.worker_count);
    info!("  Max outstanding: {}", args.max_outstanding);
    info!("  Max cache age: {} days", args.max_cache_age_days);
    info!("  Pregeneration enabled: {}", !args.disable_pregeneration);

    let upstream = NodeRpcAdapter::new(NodeRpcConfig {
        url: args.node_rpc_url.clone(),
        timeout: Duration::from_secs(args.rpc_timeout_secs),
    })
    .context("creating node RPC client")?;

    let cache = WorkCache::start(args.work_cache_config(), Arc::new(upstream))
        .await
        .context("starting work cache")?;

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_cache = cache.clone();
    let metrics_shutdown = shutdown.clone();
    let metrics_task = tokio::spawn(async move {
        if let Err(e) =
            server::serve_metrics(&metrics_addr, metrics_cache, metrics_shutdown).await
        {
            error!("Metrics server error: {}", e);
        }
    });

    // Start RPC server
    let rpc = RpcServer::new(
        ServerConfig {
            max_active_handlers: args.max_active_handlers,
            enable_pregeneration: !args.disable_pregeneration,
        },
        cache.clone(),
    );
    let listen_addr = args.listen_addr.clone();
    let rpc_shutdown = shutdown.clone();
    let rpc_task = tokio::spawn(async move { rpc.serve(&listen_addr, rpc_shutdown).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    match rpc_task.await {
        Ok(Err(e)) => error!("RPC server error: {}", e),
        Err(e) => error!("RPC server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = metrics_task.await;

    cache.shutdown().await.context("shutting down work cache")?;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
