//! Backend port
//!
//! The coordinator talks to object storage only through [`ChunkBackend`]. One
//! backend instance is created per upload by a [`BackendFactory`] and is driven
//! by exactly one worker at a time, so implementations never see concurrent
//! calls and may keep per-upload state (upload ids, completed part lists, open
//! file handles) in `&mut self`.
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::backend::{filesystem::FilesystemBackend, BackendFactory, ChunkBackend};
//! use std::sync::Arc;
//!
//! let factory: Arc<dyn BackendFactory> = Arc::new(|| {
//!     Box::new(FilesystemBackend::new("/var/lib/uploads")) as Box<dyn ChunkBackend>
//! });
//! let backend = factory.create();
//! assert!(!backend.is_initialized());
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod filesystem;
pub mod memory;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Backend not initialized")]
    NotInitialized,

    #[error("Part {actual} out of order (expected {expected})")]
    OutOfOrder { expected: u32, actual: u32 },

    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

/// What a backend learns about an upload when it is initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    /// Destination key, e.g. a relative object path
    pub identifier: String,
    /// Declared total size, if the producer knows it
    pub total_size: Option<u64>,
    /// `ceil(total_size / chunk_size)` when the size is known
    pub expected_parts: Option<u64>,
    /// Upper bound for a single part
    pub chunk_size: usize,
}

/// Capability set a storage binding exposes to the coordinator.
///
/// Parts arrive strictly in order with 1-based, gap-free part numbers.
/// `cleanup` is only called when an incomplete upload expires or is
/// superseded, never after a successful `complete`.
#[async_trait]
pub trait ChunkBackend: Send {
    /// True once `initialize` has succeeded for this upload
    fn is_initialized(&self) -> bool;

    /// Create the remote upload session
    async fn initialize(&mut self, upload: &UploadDescriptor) -> Result<(), BackendError>;

    /// Upload one part
    async fn upload_part(&mut self, part_number: u32, part: Bytes) -> Result<(), BackendError>;

    /// Finalize the upload after the last part
    async fn complete(&mut self) -> Result<(), BackendError>;

    /// Release whatever an abandoned upload holds
    async fn cleanup(&mut self);
}

/// Creates one backend per upload.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn ChunkBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Box<dyn ChunkBackend> + Send + Sync,
{
    fn create(&self) -> Box<dyn ChunkBackend> {
        self()
    }
}
