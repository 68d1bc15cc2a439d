use anyhow::{Context, Result};
use artcache_server::{
    AppState, ArtifactStore, CacheService, RpcServer, RpcServerConfig, ServerConfig, server,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "artcache-server")]
#[command(about = "Shared build artifact cache server", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// RPC port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Content directory (content is kept in memory when omitted)
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = args.rpc_port {
        config.server.rpc_port = port;
    }
    if let Some(directory) = args.directory {
        config.storage.directory = Some(directory);
    }
    config.validate()?;

    init_tracing(&config);

    info!("Starting artcache server v{}", env!("CARGO_PKG_VERSION"));

    let store = ArtifactStore::open(config.to_store_config())?;
    let service: Arc<dyn CacheService> = Arc::new(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.protocols.http.enabled {
        let listener = tokio::net::TcpListener::bind(config.http_addr())
            .await
            .with_context(|| format!("failed to bind HTTP on {}", config.http_addr()))?;
        let state = AppState {
            service: Arc::clone(&service),
        };
        let max_body = config.max_body_bytes();
        let shutdown = wait_for(shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::http::serve(listener, state, max_body, shutdown).await {
                error!("HTTP server failed: {}", e);
            }
        }));
    }

    if config.protocols.rpc.enabled {
        let listener = tokio::net::TcpListener::bind(config.rpc_addr())
            .await
            .with_context(|| format!("failed to bind RPC on {}", config.rpc_addr()))?;
        let rpc = RpcServer::new(
            Arc::clone(&service),
            RpcServerConfig {
                max_frame_bytes: config.max_frame_bytes(),
                idle_timeout: Duration::from_secs(config.protocols.rpc.idle_timeout_secs),
            },
        );
        let shutdown = wait_for(shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = rpc.serve(listener, shutdown).await {
                error!("RPC server failed: {}", e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    info!("artcache server stopped");
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "pretty" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
