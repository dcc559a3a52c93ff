//! HTTP server module
//!
//! Resumable upload endpoint on top of `hyper`:
//!
//! | Request | Effect |
//! |---|---|
//! | `PUT /uploads/{id}` (+ `Upload-Length`) | start a new upload from the body |
//! | `PATCH /uploads/{id}` (+ `Upload-Offset`) | resume an interrupted upload |
//! | `HEAD /uploads/{id}` | current offset of an incomplete upload |
//! | `GET /health` | liveness |
//!
//! PUT and PATCH stream the body into the coordinator and answer once the
//! upload round has finished.
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::backend::{memory::MemoryBackend, ChunkBackend};
//! use chunk_uploadr::config::UploadConfig;
//! use chunk_uploadr::server::UploadServer;
//! use chunk_uploadr::upload::UploadManager;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(UploadManager::new(
//!     UploadConfig::default(),
//!     Arc::new(|| Box::new(MemoryBackend::default()) as Box<dyn ChunkBackend>),
//! ));
//! tokio::spawn(manager.clone().run_dispatcher());
//!
//! let server = UploadServer::bind("127.0.0.1:0", manager).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod handlers;

use crate::upload::UploadManager;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use handlers::{UploadResponse, UPLOAD_LENGTH, UPLOAD_OFFSET};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// HTTP front end for an [`UploadManager`]
pub struct UploadServer {
    manager: Arc<UploadManager>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl UploadServer {
    /// Bind to `address`. Port 0 picks a free port, see [`local_addr`](Self::local_addr).
    pub async fn bind(address: &str, manager: Arc<UploadManager>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address {}: {}", address, e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            manager,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "Upload server listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let manager = Arc::clone(&manager);
                    async move { handlers::handle_request(req, manager).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(peer = %peer_addr, error = %e, "Error serving connection");
                }
            });
        }

        info!("Upload server stopped");
        Ok(())
    }
}
