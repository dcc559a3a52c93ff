//! Upload registry and dispatcher
//!
//! [`UploadManager`] is the single authority over which identifiers are
//! uploading. `start` and `resume` only hand uploads to the dispatcher through
//! a bounded intake queue; [`UploadManager::run_dispatcher`] registers them,
//! spawns their workers and periodically evicts uploads that were abandoned.

use super::registry::Registry;
use super::session::Upload;
use super::status::{UploadNotifier, UploadStatus};
use super::worker::Worker;
use super::UploadError;
use crate::backend::BackendFactory;
use crate::config::UploadConfig;
use crate::metrics;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Coordinates resumable chunked uploads against one kind of backend
pub struct UploadManager {
    config: UploadConfig,
    factory: Arc<dyn BackendFactory>,
    registry: Arc<Registry>,
    intake_tx: mpsc::Sender<Arc<Upload>>,
    intake_rx: Mutex<mpsc::Receiver<Arc<Upload>>>,
    shutdown: CancellationToken,
}

impl UploadManager {
    /// Create a manager. Nothing is uploaded until [`run_dispatcher`](Self::run_dispatcher) runs.
    pub fn new(config: UploadConfig, factory: Arc<dyn BackendFactory>) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_queue_capacity.max(1));
        Self {
            config,
            factory,
            registry: Arc::new(Registry::new()),
            intake_tx,
            intake_rx: Mutex::new(intake_rx),
            shutdown: CancellationToken::new(),
        }
    }

    /// Part size used to split streams
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size_limit
    }

    /// Settings every upload of this manager is created with
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Start uploading `reader` to `identifier`.
    ///
    /// Returns as soon as the upload is queued for dispatch; all outcomes are
    /// reported on the returned notifier, which the caller must drain until a
    /// terminal event. `reader` belongs to the upload from here on. An upload
    /// already registered under `identifier` is replaced and cleaned up.
    pub async fn start<R>(
        &self,
        identifier: &str,
        total_size: Option<u64>,
        reader: R,
    ) -> UploadNotifier
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let upload = Arc::new(Upload::new(
            identifier.to_string(),
            total_size,
            &self.config,
            self.factory.create(),
            self.shutdown.child_token(),
        ));
        let notifier = upload.notifier();

        if self.is_shut_down() {
            upload.emit_error(UploadError::ShuttingDown).await;
            return notifier;
        }

        {
            let mut control = upload.lock_feed().await;
            upload.launch_feeder(&mut control, reader);
        }
        upload.set_processing(true);

        tracing::info!(
            identifier = %identifier,
            total_size = ?total_size,
            expected_parts = ?upload.expected_parts(),
            "Upload started"
        );
        metrics::record_upload_started();

        self.enqueue(upload).await;
        notifier
    }

    /// Continue a registered upload with a new reader.
    ///
    /// The reader must be positioned at the bytes the upload has already
    /// accepted, which is [`Upload::uploaded_bytes`] once the upload has
    /// stopped with an error.
    pub async fn resume<R>(&self, identifier: &str, reader: R) -> Result<UploadNotifier, UploadError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.resume_inner(identifier, None, reader).await
    }

    /// Like [`resume`](Self::resume), but fails with
    /// [`UploadError::OffsetMismatch`] unless `offset` equals the number of
    /// bytes the upload has accepted, and with [`UploadError::Busy`] while the
    /// previous producer is still being read. A rejected call leaves the
    /// running upload as it was.
    pub async fn resume_from<R>(
        &self,
        identifier: &str,
        offset: u64,
        reader: R,
    ) -> Result<UploadNotifier, UploadError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.resume_inner(identifier, Some(offset), reader).await
    }

    async fn resume_inner<R>(
        &self,
        identifier: &str,
        offset: Option<u64>,
        reader: R,
    ) -> Result<UploadNotifier, UploadError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.is_shut_down() {
            return Err(UploadError::ShuttingDown);
        }
        let upload = self.registry.get(identifier).ok_or(UploadError::NotFound)?;

        let mut control = upload.lock_feed().await;
        if upload.is_evicted() {
            return Err(UploadError::NotFound);
        }

        // A rejected strict resume must leave the current producer untouched.
        if let Some(offset) = offset {
            let accepted = upload.accepted_bytes();
            if offset != accepted {
                return Err(UploadError::OffsetMismatch {
                    expected: accepted,
                    actual: offset,
                });
            }
            if control.is_feeding() {
                return Err(UploadError::Busy);
            }
        }

        upload.stop_feeder(&mut control).await;
        let accepted = upload.accepted_bytes();

        upload.touch();
        upload.launch_feeder(&mut control, reader);
        let redispatch = upload.claim_processing();
        drop(control);

        tracing::info!(
            identifier = %identifier,
            offset = accepted,
            redispatch,
            "Upload resumed"
        );
        metrics::record_upload_resumed();

        if redispatch {
            self.enqueue(upload.clone()).await;
        }
        Ok(upload.notifier())
    }

    async fn enqueue(&self, upload: Arc<Upload>) {
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            result = self.intake_tx.send(upload.clone()) => result.is_ok(),
        };
        if !sent {
            {
                let mut control = upload.lock_feed().await;
                upload.stop_feeder(&mut control).await;
                upload.rewind_accepted();
                upload.set_processing(false);
            }
            upload.emit_error(UploadError::ShuttingDown).await;
        }
    }

    /// Look up an upload that is registered and not yet complete.
    ///
    /// Repeated calls return the same `Arc` until the upload is replaced,
    /// completed or evicted.
    pub fn get_incomplete_upload(&self, identifier: &str) -> Option<Arc<Upload>> {
        self.registry.get(identifier)
    }

    /// Whether an incomplete upload is registered under `identifier`
    pub fn upload_exists(&self, identifier: &str) -> bool {
        self.registry.contains(identifier)
    }

    /// Number of registered uploads
    pub fn incomplete_count(&self) -> usize {
        self.registry.len()
    }

    /// Dispatch queued uploads and sweep expired ones until [`shutdown`](Self::shutdown).
    ///
    /// Only one dispatcher runs per manager; a second call returns immediately.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let Ok(mut intake) = self.intake_rx.try_lock() else {
            tracing::warn!("Dispatcher already running");
            return;
        };

        let period = self.config.sweep_interval();
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(sweep_interval = ?period, "Upload dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep_expired().await;
                }
                Some(upload) = intake.recv() => self.dispatch(upload),
            }
        }

        // Uploads still queued were never picked up
        while let Ok(upload) = intake.try_recv() {
            upload.set_processing(false);
            upload.emit_error(UploadError::ShuttingDown).await;
        }
        tracing::info!("Upload dispatcher stopped");
    }

    fn dispatch(&self, upload: Arc<Upload>) {
        if upload.is_evicted() {
            tracing::debug!(identifier = %upload.identifier(), "Skipping evicted upload");
            return;
        }

        if let Some(previous) = self.registry.insert(upload.clone()) {
            tracing::info!(identifier = %previous.identifier(), "Replacing registered upload");
            tokio::spawn(async move {
                previous.evict().await;
            });
        }

        let worker = Worker::new(upload, self.registry.clone(), self.config.idle_timeout());
        tokio::spawn(worker.run());
    }

    /// Evict every registered upload whose expiry has passed.
    ///
    /// Each evicted upload is cancelled and its backend cleaned up exactly
    /// once, also when sweeps overlap. Returns the number of uploads evicted
    /// by this call.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.registry.remove_expired(Instant::now());
        let mut evicted = 0;
        for upload in expired {
            if upload.evict().await {
                tracing::info!(
                    identifier = %upload.identifier(),
                    uploaded_bytes = upload.uploaded_bytes(),
                    "Evicted expired upload"
                );
                evicted += 1;
            }
        }

        if evicted > 0 {
            metrics::record_expired(evicted);
        }
        tracing::debug!(evicted, remaining = self.registry.len(), "Expiry sweep finished");
        evicted
    }

    /// Stop the dispatcher and cancel every running worker.
    ///
    /// Registered uploads keep their progress but cannot be resumed through
    /// this manager anymore.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(incomplete = self.registry.len(), "Upload manager shutting down");
        }
        self.shutdown.cancel();
    }

    /// True once [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
