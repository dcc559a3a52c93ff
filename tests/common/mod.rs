//! Shared helpers for coordinator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunk_uploadr::backend::{BackendError, ChunkBackend, UploadDescriptor};
use chunk_uploadr::config::UploadConfig;
use chunk_uploadr::upload::{UploadManager, UploadNotifier, UploadStatus};
use parking_lot::Mutex;
use std::sync::Arc;

/// One backend call, in the order the coordinator made it
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Initialize(UploadDescriptor),
    Part(u32, Bytes),
    FailedPart(u32),
    Complete,
    FailedComplete,
    Cleanup,
}

#[derive(Default)]
struct Script {
    fail_init: bool,
    fail_parts: Vec<u32>,
    fail_completes: u32,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    script: Script,
}

/// Call log shared by every backend a test's factory creates
#[derive(Clone, Default)]
pub struct BackendLog {
    inner: Arc<Mutex<Inner>>,
}

impl BackendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    /// Acknowledged parts
    pub fn parts(&self) -> Vec<(u32, Bytes)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Part(n, bytes) => Some((n, bytes)),
                _ => None,
            })
            .collect()
    }

    pub fn part_numbers(&self) -> Vec<u32> {
        self.parts().into_iter().map(|(n, _)| n).collect()
    }

    pub fn part_sizes(&self) -> Vec<usize> {
        self.parts().into_iter().map(|(_, b)| b.len()).collect()
    }

    /// Acknowledged bytes concatenated in call order
    pub fn uploaded(&self) -> Vec<u8> {
        self.parts()
            .into_iter()
            .flat_map(|(_, bytes)| bytes.to_vec())
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn initializations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Initialize(_)))
            .count()
    }

    pub fn fail_init(&self) {
        self.inner.lock().script.fail_init = true;
    }

    /// Fail the next attempt to upload `part_number`
    pub fn fail_part_once(&self, part_number: u32) {
        self.inner.lock().script.fail_parts.push(part_number);
    }

    pub fn fail_complete_once(&self) {
        self.inner.lock().script.fail_completes += 1;
    }

    pub fn factory(&self) -> Arc<dyn chunk_uploadr::backend::BackendFactory> {
        let log = self.clone();
        Arc::new(move || Box::new(RecordingBackend::new(log.clone())) as Box<dyn ChunkBackend>)
    }
}

/// Backend that records calls and fails on demand
pub struct RecordingBackend {
    log: BackendLog,
    initialized: bool,
}

impl RecordingBackend {
    pub fn new(log: BackendLog) -> Self {
        Self {
            log,
            initialized: false,
        }
    }
}

#[async_trait]
impl ChunkBackend for RecordingBackend {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn initialize(&mut self, upload: &UploadDescriptor) -> Result<(), BackendError> {
        let mut inner = self.log.inner.lock();
        inner.calls.push(Call::Initialize(upload.clone()));
        if inner.script.fail_init {
            return Err(BackendError::Rejected("bucket does not exist".into()));
        }
        self.initialized = true;
        Ok(())
    }

    async fn upload_part(&mut self, part_number: u32, part: Bytes) -> Result<(), BackendError> {
        let mut inner = self.log.inner.lock();
        if let Some(pos) = inner.script.fail_parts.iter().position(|n| *n == part_number) {
            inner.script.fail_parts.remove(pos);
            inner.calls.push(Call::FailedPart(part_number));
            return Err(BackendError::Rejected("503 Slow Down".into()));
        }
        inner.calls.push(Call::Part(part_number, part));
        Ok(())
    }

    async fn complete(&mut self) -> Result<(), BackendError> {
        let mut inner = self.log.inner.lock();
        if inner.script.fail_completes > 0 {
            inner.script.fail_completes -= 1;
            inner.calls.push(Call::FailedComplete);
            return Err(BackendError::Rejected("500 Internal Error".into()));
        }
        inner.calls.push(Call::Complete);
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.log.inner.lock().calls.push(Call::Cleanup);
        self.initialized = false;
    }
}

/// Small parts, a short idle timeout and a sweep that only runs when asked
pub fn test_config(chunk_size: usize) -> UploadConfig {
    UploadConfig {
        chunk_size_limit: chunk_size,
        idle_timeout_secs: 5,
        incomplete_upload_expiry_secs: 600,
        sweep_interval_secs: 1_000_000,
        ..Default::default()
    }
}

/// Manager with a running dispatcher
pub fn manager(config: UploadConfig, log: &BackendLog) -> Arc<UploadManager> {
    let manager = Arc::new(UploadManager::new(config, log.factory()));
    tokio::spawn(manager.clone().run_dispatcher());
    manager
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Progress values up to and including the next terminal event
pub async fn collect(notifier: &UploadNotifier) -> (Vec<u64>, UploadStatus) {
    let mut progress = Vec::new();
    while let Some(status) = notifier.recv().await {
        match status {
            UploadStatus::Progress { uploaded_bytes } => progress.push(uploaded_bytes),
            terminal => return (progress, terminal),
        }
    }
    panic!("notifier closed before a terminal event");
}

/// Wait for the next progress event
pub async fn next_progress(notifier: &UploadNotifier) -> u64 {
    match notifier.recv().await {
        Some(UploadStatus::Progress { uploaded_bytes }) => uploaded_bytes,
        other => panic!("expected progress, got {:?}", other),
    }
}
