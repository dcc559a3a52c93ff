//! Prometheus Metrics HTTP Server
//!
//! Serves `GET /metrics` for scraping and `GET /health` for liveness probes on a
//! port separate from the upload endpoint.
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::metrics::server::MetricsServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = MetricsServer::builder().port(9090).build()?;
//!     let addr = server.start().await?;
//!     println!("Metrics server listening on {}", addr);
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Configuration for the metrics server
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9090")
    pub address: String,
}

/// Builder for MetricsServer
#[derive(Default)]
pub struct MetricsServerBuilder {
    address: Option<String>,
}

impl MetricsServerBuilder {
    /// Set the full bind address
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Listen on all interfaces at `port`
    pub fn port(mut self, port: u16) -> Self {
        self.address = Some(format!("0.0.0.0:{}", port));
        self
    }

    /// Build the MetricsServer
    pub fn build(self) -> Result<MetricsServer, MetricsServerError> {
        let address = self
            .address
            .ok_or_else(|| MetricsServerError::ConfigError("Address is required".into()))?;

        Ok(MetricsServer::new(MetricsServerConfig { address }))
    }
}

/// Metrics server error
#[derive(Debug, thiserror::Error)]
pub enum MetricsServerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Prometheus metrics HTTP server
pub struct MetricsServer {
    config: MetricsServerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig) -> Self {
        Self {
            config,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    pub fn builder() -> MetricsServerBuilder {
        MetricsServerBuilder::default()
    }

    /// Bind and serve in a background task
    ///
    /// Returns the actual bound address (useful when using port 0)
    pub async fn start(&mut self) -> Result<SocketAddr, MetricsServerError> {
        let listener = TcpListener::bind(&self.config.address).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.server_handle = Some(tokio::spawn(run_server(listener, shutdown_rx)));

        tracing::info!(address = %addr, "Metrics server listening");
        Ok(addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_server(listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let io = TokioIo::new(stream);
                        tokio::spawn(async move {
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service_fn(handle_request))
                                .await
                            {
                                tracing::debug!(error = %e, "Metrics connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept metrics connection");
                    }
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_handler(),
        (&Method::GET, "/health") => health_handler(),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from("Not Found")),
    };
    Ok(response)
}

fn metrics_handler() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Bytes::from("Failed to encode metrics"),
        );
    }

    respond(StatusCode::OK, TEXT_FORMAT, Bytes::from(buffer))
}

fn health_handler() -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "status": "ok",
        "incomplete_uploads": super::INCOMPLETE_UPLOADS.get(),
    });
    respond(StatusCode::OK, "application/json", Bytes::from(body.to_string()))
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
