//! Per-upload state machine
//!
//! A worker owns the part queue and the backend of one upload for as long as
//! it runs: `Uninitialized -> Draining -> {Completed, Failed}`. Only the
//! dispatcher spawns workers, and the part-queue lock keeps it to one worker
//! per upload at any time.

use super::feeder::Feed;
use super::registry::Registry;
use super::session::Upload;
use super::status::UploadStatus;
use super::UploadError;
use crate::backend::ChunkBackend;
use crate::metrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) struct Worker {
    upload: Arc<Upload>,
    registry: Arc<Registry>,
    idle_timeout: Duration,
    /// Feeder generation the worker last waited on
    generation: u64,
}

impl Worker {
    pub(crate) fn new(upload: Arc<Upload>, registry: Arc<Registry>, idle_timeout: Duration) -> Self {
        Self {
            upload,
            registry,
            idle_timeout,
            generation: 0,
        }
    }

    #[tracing::instrument(
        name = "upload.worker",
        skip(self),
        fields(
            identifier = %self.upload.identifier(),
            total_size = ?self.upload.total_size(),
        )
    )]
    pub(crate) async fn run(mut self) {
        let upload = self.upload.clone();
        let mut parts = upload.lock_parts().await;
        let mut backend = upload.lock_backend().await;

        tracing::debug!(
            uploaded_bytes = upload.uploaded_bytes(),
            "Worker started"
        );

        if let Err(cause) = self.initialize(&mut **backend).await {
            if let UploadError::Init(_) = cause {
                self.reject(cause).await;
                return;
            }
            self.fail_and_report(&mut parts, cause).await;
            return;
        }

        loop {
            let cause = match self.drain(&mut parts, &mut **backend).await {
                Ok(()) => {
                    drop(backend);
                    drop(parts);
                    self.finish().await;
                    return;
                }
                Err(cause) => cause,
            };

            if self.fail_and_report(&mut parts, cause).await {
                return;
            }
            tracing::debug!("Resumed while reporting failure, continuing");
        }
    }

    async fn initialize(&self, backend: &mut dyn ChunkBackend) -> Result<(), UploadError> {
        if self.upload.cancel_token().is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        if backend.is_initialized() {
            return Ok(());
        }
        backend
            .initialize(&self.upload.descriptor())
            .await
            .map_err(UploadError::Init)?;
        tracing::debug!("Backend initialized");
        Ok(())
    }

    /// Pull chunks until the upload is complete or something stops it
    async fn drain(
        &mut self,
        parts: &mut mpsc::Receiver<Feed>,
        backend: &mut dyn ChunkBackend,
    ) -> Result<(), UploadError> {
        let upload = self.upload.clone();
        let cancel = upload.cancel_token();

        loop {
            if upload.is_complete() {
                return backend.complete().await.map_err(UploadError::Complete);
            }

            self.generation = upload.feed_generation();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                next = tokio::time::timeout(self.idle_timeout, parts.recv()) => next,
            };

            match next {
                Ok(Some(Feed::Chunk(chunk))) => self.upload_part(backend, chunk).await?,
                Ok(Some(Feed::EndOfStream)) => {
                    if upload.total_size().is_none() {
                        return backend.complete().await.map_err(UploadError::Complete);
                    }
                    tracing::debug!(
                        uploaded_bytes = upload.uploaded_bytes(),
                        "Stream ended before declared size"
                    );
                }
                Ok(Some(Feed::Failed(e))) => return Err(UploadError::Read(e)),
                Ok(None) => return Err(UploadError::Cancelled),
                Err(_) if upload.feed_generation() != self.generation => continue,
                Err(_) => return Err(UploadError::Timeout(self.idle_timeout)),
            }
        }
    }

    async fn upload_part(
        &self,
        backend: &mut dyn ChunkBackend,
        chunk: Bytes,
    ) -> Result<(), UploadError> {
        let upload = &self.upload;
        let len = chunk.len() as u64;

        if let Some(total) = upload.total_size() {
            let received = upload.uploaded_bytes() + len;
            if received > total {
                return Err(UploadError::SizeExceeded {
                    expected: total,
                    received,
                });
            }
        }

        let part_number = upload.next_part();
        if let Err(source) = backend.upload_part(part_number, chunk).await {
            metrics::record_part_failure();
            return Err(UploadError::Part {
                part_number,
                source,
            });
        }

        let uploaded_bytes = upload.acknowledge(part_number, len);
        metrics::record_part_uploaded(len);
        tracing::debug!(part_number, bytes = len, uploaded_bytes, "Part uploaded");

        upload.emit(UploadStatus::Progress { uploaded_bytes }).await;
        Ok(())
    }

    /// Stop the round after a failure and report it.
    ///
    /// Returns false if a resume arrived in the meantime and the worker should
    /// keep draining.
    async fn fail_and_report(
        &mut self,
        parts: &mut mpsc::Receiver<Feed>,
        cause: UploadError,
    ) -> bool {
        let upload = self.upload.clone();

        {
            let mut control = upload.lock_feed().await;
            if matches!(cause, UploadError::Timeout(_))
                && upload.feed_generation() != self.generation
            {
                return false;
            }
            upload.stop_feeder(&mut control).await;
            while parts.try_recv().is_ok() {}
            upload.rewind_accepted();
            self.generation = upload.feed_generation();
        }

        let resumable = cause.is_resumable();
        metrics::record_upload_failure(
            cause.kind(),
            resumable,
            upload.started_at().elapsed().as_secs_f64(),
        );
        tracing::warn!(
            error = %cause,
            uploaded_bytes = upload.uploaded_bytes(),
            received_parts = upload.received_parts(),
            "Upload interrupted"
        );
        upload.emit_error(cause).await;

        let _control = upload.lock_feed().await;
        if upload.feed_generation() != self.generation {
            return false;
        }
        upload.set_processing(false);
        true
    }

    /// Backend refused to start the upload; it never becomes resumable
    async fn reject(&self, cause: UploadError) {
        let upload = &self.upload;
        self.registry.remove(upload);
        {
            let mut control = upload.lock_feed().await;
            upload.retire();
            upload.stop_feeder(&mut control).await;
            upload.set_processing(false);
        }

        metrics::record_upload_failure(
            cause.kind(),
            false,
            upload.started_at().elapsed().as_secs_f64(),
        );
        tracing::error!(error = %cause, "Upload initialization failed");
        upload.emit_error(cause).await;
    }

    async fn finish(&self) {
        let upload = &self.upload;
        self.registry.remove(upload);
        {
            let mut control = upload.lock_feed().await;
            upload.retire();
            upload.stop_feeder(&mut control).await;
            upload.set_processing(false);
        }

        metrics::record_upload_success(upload.started_at().elapsed().as_secs_f64());
        tracing::info!(
            uploaded_bytes = upload.uploaded_bytes(),
            uploaded_parts = upload.uploaded_parts(),
            "Upload completed"
        );
        upload.emit(UploadStatus::completed()).await;
    }
}
