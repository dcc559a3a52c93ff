//! Chunk Uploadr - resumable chunked upload server
//!
//! Accepts uploads over HTTP and writes them below a storage root in
//! fixed-size parts, keeping interrupted uploads resumable.

use chunk_uploadr::backend::{filesystem::FilesystemBackend, ChunkBackend};
use chunk_uploadr::config::Config;
use chunk_uploadr::logging::init_logging;
use chunk_uploadr::metrics::server::MetricsServer;
use chunk_uploadr::server::UploadServer;
use chunk_uploadr::upload::UploadManager;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Chunk Uploadr - resumable chunked uploads
#[derive(Parser, Debug)]
#[command(name = "chunk-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    info!(
        version = chunk_uploadr::VERSION,
        config = %args.config.display(),
        "Starting Chunk Uploadr"
    );

    tokio::fs::create_dir_all(&config.storage.root).await?;
    let root = PathBuf::from(&config.storage.root);
    let manager = Arc::new(UploadManager::new(
        config.upload.clone(),
        Arc::new(move || Box::new(FilesystemBackend::new(&root)) as Box<dyn ChunkBackend>),
    ));
    let dispatcher = tokio::spawn(manager.clone().run_dispatcher());

    let mut metrics_server = if config.metrics.enabled {
        let mut server = MetricsServer::builder().port(config.metrics.port).build()?;
        server.start().await?;
        Some(server)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let server = UploadServer::bind(&config.server.address, manager.clone()).await?;
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    manager.shutdown();
    server_task.await??;
    dispatcher.await?;
    if let Some(server) = metrics_server.as_mut() {
        server.shutdown().await;
    }

    Ok(())
}
