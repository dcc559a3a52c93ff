//! Per-upload state
//!
//! An [`Upload`] is shared between the manager (registry, resume, sweep), its
//! worker and its feeder. Counters live behind a `parking_lot` lock that is
//! never held across an await; the part queue, the backend and the feeder
//! handle sit behind async mutexes because their owners await while holding
//! them.

use super::feeder::{self, Feed};
use super::status::{self, StatusSender, UploadNotifier, UploadStatus};
use super::{expected_parts, UploadError};
use crate::backend::{ChunkBackend, UploadDescriptor};
use crate::config::UploadConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct UploadState {
    received_parts: u64,
    uploaded_parts: u32,
    uploaded_bytes: u64,
    expiry: Instant,
    processing: bool,
}

/// The feeder currently filling the part queue
#[derive(Default)]
pub(crate) struct FeedControl {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl FeedControl {
    /// True while a feeder task is still reading its producer
    pub(crate) fn is_feeding(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// One in-flight transfer
pub struct Upload {
    identifier: String,
    total_size: Option<u64>,
    expected_parts: Option<u64>,
    chunk_size: usize,
    expiry_ttl: Duration,
    started_at: Instant,
    state: RwLock<UploadState>,
    accepted_bytes: Arc<AtomicU64>,
    notifier: UploadNotifier,
    status_tx: StatusSender,
    parts_tx: mpsc::Sender<Feed>,
    parts_rx: Mutex<mpsc::Receiver<Feed>>,
    backend: Mutex<Box<dyn ChunkBackend>>,
    feed: Mutex<FeedControl>,
    feed_generation: AtomicU64,
    cancel: CancellationToken,
    evicted: AtomicBool,
}

impl Upload {
    pub(crate) fn new(
        identifier: String,
        total_size: Option<u64>,
        config: &UploadConfig,
        backend: Box<dyn ChunkBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let expected_parts = total_size.map(|size| expected_parts(size, config.chunk_size_limit));
        let queue_capacity = expected_parts
            .map(|parts| parts.min(config.max_queued_parts as u64) as usize)
            .unwrap_or(config.max_queued_parts)
            .max(1);

        let (parts_tx, parts_rx) = mpsc::channel(queue_capacity);
        let (status_tx, notifier) = status::channel(config.notifier_capacity);
        let expiry_ttl = config.incomplete_upload_expiry();
        let now = Instant::now();

        Self {
            identifier,
            total_size,
            expected_parts,
            chunk_size: config.chunk_size_limit,
            expiry_ttl,
            started_at: now,
            state: RwLock::new(UploadState {
                received_parts: 0,
                uploaded_parts: 0,
                uploaded_bytes: 0,
                expiry: now + expiry_ttl,
                processing: false,
            }),
            accepted_bytes: Arc::new(AtomicU64::new(0)),
            notifier,
            status_tx,
            parts_tx,
            parts_rx: Mutex::new(parts_rx),
            backend: Mutex::new(backend),
            feed: Mutex::new(FeedControl::default()),
            feed_generation: AtomicU64::new(0),
            cancel,
            evicted: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Declared size, `None` when streaming without a known length
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn expected_parts(&self) -> Option<u64> {
        self.expected_parts
    }

    /// Chunks taken off the part queue so far
    pub fn received_parts(&self) -> u64 {
        self.state.read().received_parts
    }

    /// Parts acknowledged by the backend
    pub fn uploaded_parts(&self) -> u32 {
        self.state.read().uploaded_parts
    }

    /// Bytes acknowledged by the backend. This is the offset a resuming
    /// producer continues from once the upload has stopped.
    pub fn uploaded_bytes(&self) -> u64 {
        self.state.read().uploaded_bytes
    }

    /// Bytes read from producers and queued or uploaded
    pub fn accepted_bytes(&self) -> u64 {
        self.accepted_bytes.load(Ordering::SeqCst)
    }

    pub fn expires_at(&self) -> Instant {
        self.state.read().expiry
    }

    /// True while a worker is draining the part queue
    pub fn is_processing(&self) -> bool {
        self.state.read().processing
    }

    /// True once every declared byte has been acknowledged.
    /// Uploads of unknown size complete on end-of-stream instead.
    pub fn is_complete(&self) -> bool {
        match self.total_size {
            Some(total) => self.state.read().uploaded_bytes >= total,
            None => false,
        }
    }

    /// A handle to this upload's status channel
    pub fn notifier(&self) -> UploadNotifier {
        self.notifier.clone()
    }

    pub(crate) fn descriptor(&self) -> UploadDescriptor {
        UploadDescriptor {
            identifier: self.identifier.clone(),
            total_size: self.total_size,
            expected_parts: self.expected_parts,
            chunk_size: self.chunk_size,
        }
    }

    pub(crate) fn started_at(&self) -> Instant {
        self.started_at
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Refuse further resumes without cleaning up the backend
    pub(crate) fn retire(&self) {
        self.evicted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.state.read().expiry <= now
    }

    /// Push the expiry out by the configured TTL
    pub(crate) fn touch(&self) {
        self.state.write().expiry = Instant::now() + self.expiry_ttl;
    }

    pub(crate) fn set_processing(&self, processing: bool) {
        self.state.write().processing = processing;
    }

    /// Mark the upload as processing. Returns false if a worker already owns it.
    pub(crate) fn claim_processing(&self) -> bool {
        let mut state = self.state.write();
        if state.processing {
            return false;
        }
        state.processing = true;
        true
    }

    /// Count a chunk taken off the queue and return the part number it will use
    pub(crate) fn next_part(&self) -> u32 {
        let mut state = self.state.write();
        state.received_parts += 1;
        state.uploaded_parts + 1
    }

    /// Record a part the backend accepted; returns the new byte total
    pub(crate) fn acknowledge(&self, part_number: u32, bytes: u64) -> u64 {
        let mut state = self.state.write();
        state.uploaded_parts = part_number;
        state.uploaded_bytes += bytes;
        state.expiry = Instant::now() + self.expiry_ttl;
        state.uploaded_bytes
    }

    /// Forget bytes that were queued but never acknowledged
    pub(crate) fn rewind_accepted(&self) {
        let uploaded = self.state.read().uploaded_bytes;
        self.accepted_bytes.store(uploaded, Ordering::SeqCst);
    }

    pub(crate) async fn lock_parts(&self) -> MutexGuard<'_, mpsc::Receiver<Feed>> {
        self.parts_rx.lock().await
    }

    pub(crate) async fn lock_backend(&self) -> MutexGuard<'_, Box<dyn ChunkBackend>> {
        self.backend.lock().await
    }

    pub(crate) async fn lock_feed(&self) -> MutexGuard<'_, FeedControl> {
        self.feed.lock().await
    }

    pub(crate) fn feed_generation(&self) -> u64 {
        self.feed_generation.load(Ordering::SeqCst)
    }

    /// Start a feeder reading `reader` into the part queue.
    ///
    /// The caller must have stopped the previous feeder through the same guard.
    pub(crate) fn launch_feeder<R>(&self, control: &mut FeedControl, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let token = self.cancel.child_token();
        let handle = tokio::spawn(feeder::run(
            reader,
            self.chunk_size,
            self.parts_tx.clone(),
            self.accepted_bytes.clone(),
            token.clone(),
        ));
        control.token = Some(token);
        control.handle = Some(handle);
        self.feed_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Cancel the running feeder and wait for it to exit
    pub(crate) async fn stop_feeder(&self, control: &mut FeedControl) {
        if let Some(token) = control.token.take() {
            token.cancel();
        }
        if let Some(handle) = control.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(identifier = %self.identifier, error = %e, "Feeder task failed");
            }
        }
    }

    /// Send a status event, giving up on a full buffer once cancelled
    pub(crate) async fn emit(&self, status: UploadStatus) -> bool {
        self.status_tx.send(status, &self.cancel).await
    }

    pub(crate) async fn emit_error(&self, cause: UploadError) -> bool {
        self.emit(UploadStatus::error(cause)).await
    }

    /// Tear the upload down and release the backend's resources.
    ///
    /// Only the first call does anything; it cancels the worker and feeder,
    /// waits for the worker to release the backend and then calls `cleanup`.
    pub(crate) async fn evict(&self) -> bool {
        if self.evicted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        {
            let mut control = self.lock_feed().await;
            self.stop_feeder(&mut control).await;
        }

        let mut backend = self.lock_backend().await;
        backend.cleanup().await;
        tracing::info!(
            identifier = %self.identifier,
            uploaded_bytes = self.uploaded_bytes(),
            "Cleaned up incomplete upload"
        );
        true
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Upload")
            .field("identifier", &self.identifier)
            .field("total_size", &self.total_size)
            .field("expected_parts", &self.expected_parts)
            .field("received_parts", &state.received_parts)
            .field("uploaded_parts", &state.uploaded_parts)
            .field("uploaded_bytes", &state.uploaded_bytes)
            .field("processing", &state.processing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn config(chunk: usize, max_queued: usize) -> UploadConfig {
        UploadConfig {
            chunk_size_limit: chunk,
            max_queued_parts: max_queued,
            ..Default::default()
        }
    }

    fn upload(total: Option<u64>, config: &UploadConfig) -> Upload {
        Upload::new(
            "file.bin".into(),
            total,
            config,
            Box::new(MemoryBackend::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_expected_parts_and_queue_capacity() {
        let cfg = config(100, 8);
        let known = upload(Some(250), &cfg);
        assert_eq!(known.expected_parts(), Some(3));
        assert_eq!(known.parts_tx.max_capacity(), 3);

        let large = upload(Some(10_000), &cfg);
        assert_eq!(large.parts_tx.max_capacity(), 8);

        let empty = upload(Some(0), &cfg);
        assert_eq!(empty.parts_tx.max_capacity(), 1);

        let unknown = upload(None, &cfg);
        assert_eq!(unknown.expected_parts(), None);
        assert_eq!(unknown.parts_tx.max_capacity(), 8);
    }

    #[tokio::test]
    async fn test_part_numbering_follows_acknowledgements() {
        let upload = upload(Some(300), &config(100, 4));

        assert_eq!(upload.next_part(), 1);
        assert_eq!(upload.acknowledge(1, 100), 100);

        // A failed part is counted as received but not acknowledged
        assert_eq!(upload.next_part(), 2);
        assert_eq!(upload.next_part(), 2);
        assert_eq!(upload.received_parts(), 3);
        assert_eq!(upload.uploaded_parts(), 1);
        assert!(!upload.is_complete());

        upload.acknowledge(2, 200);
        assert!(upload.is_complete());
    }

    #[tokio::test]
    async fn test_claim_processing_once() {
        let upload = upload(None, &config(10, 4));
        assert!(upload.claim_processing());
        assert!(!upload.claim_processing());
        upload.set_processing(false);
        assert!(upload.claim_processing());
    }

    #[tokio::test]
    async fn test_rewind_accepted_to_uploaded() {
        let upload = upload(Some(30), &config(10, 4));
        upload.accepted_bytes.store(30, Ordering::SeqCst);
        upload.acknowledge(1, 10);

        upload.rewind_accepted();
        assert_eq!(upload.accepted_bytes(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_touch() {
        let cfg = UploadConfig {
            incomplete_upload_expiry_secs: 60,
            ..Default::default()
        };
        let upload = upload(None, &cfg);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!upload.is_expired(Instant::now()));
        upload.touch();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!upload.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(upload.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn test_evict_only_once() {
        let upload = upload(Some(10), &config(10, 4));
        assert!(upload.evict().await);
        assert!(!upload.evict().await);
        assert!(upload.cancel_token().is_cancelled());
        assert!(upload.is_evicted());
    }
}
