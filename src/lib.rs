//! Chunk Uploadr Library
//!
//! Resumable, chunked uploads to part-based object storage.
//!
//! # Features
//!
//! - **Arbitrary reads in, fixed parts out**: producer reads are re-chunked to the backend part size
//! - **Strict ordering**: parts reach the backend in stream order with gap-free part numbers
//! - **Resumable**: stalled or failed uploads stay registered and continue from the acknowledged offset
//! - **Self-cleaning**: abandoned uploads expire and their backend state is cleaned up exactly once
//! - **Pluggable storage**: any [`backend::ChunkBackend`]; filesystem and in-memory bindings included
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::backend::{filesystem::FilesystemBackend, ChunkBackend};
//! use chunk_uploadr::config::Config;
//! use chunk_uploadr::server::UploadServer;
//! use chunk_uploadr::upload::UploadManager;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let root = config.storage.root.clone();
//!     let manager = Arc::new(UploadManager::new(
//!         config.upload.clone(),
//!         Arc::new(move || Box::new(FilesystemBackend::new(&root)) as Box<dyn ChunkBackend>),
//!     ));
//!     tokio::spawn(manager.clone().run_dispatcher());
//!
//!     let server = UploadServer::bind(&config.server.address, manager).await?;
//!     server.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use server::UploadServer;
pub use upload::{UploadError, UploadManager, UploadNotifier, UploadStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
