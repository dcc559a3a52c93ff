//! Upload coordinator
//!
//! Accepts byte streams of arbitrary read sizes, re-chunks them to the
//! configured part size and drives a [`ChunkBackend`](crate::backend::ChunkBackend)
//! strictly in order. Uploads that stall or fail mid-way stay registered so a
//! later [`UploadManager::resume`] can continue them with a new reader.
//!
//! # Components
//!
//! - [`UploadManager`] - registry and dispatcher; the only place workers are spawned
//! - [`Upload`] - one in-flight transfer: counters, expiry, part queue, backend
//! - worker - per-upload state machine draining the part queue
//! - feeder - reads the producer's stream into full-size chunks
//! - [`UploadNotifier`] - per-upload channel of [`UploadStatus`] events
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::backend::{memory::MemoryBackend, ChunkBackend};
//! use chunk_uploadr::config::UploadConfig;
//! use chunk_uploadr::upload::{UploadManager, UploadStatus};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let manager = Arc::new(UploadManager::new(
//!     UploadConfig::default(),
//!     Arc::new(|| Box::new(MemoryBackend::default()) as Box<dyn ChunkBackend>),
//! ));
//! tokio::spawn(manager.clone().run_dispatcher());
//!
//! let data: &'static [u8] = b"hello world";
//! let notifier = manager.start("greeting.txt", Some(data.len() as u64), data).await;
//! while let Some(status) = notifier.recv().await {
//!     match status {
//!         UploadStatus::Progress { uploaded_bytes } => println!("{} bytes", uploaded_bytes),
//!         UploadStatus::Ok { .. } => break,
//!         UploadStatus::Error { cause } => {
//!             eprintln!("upload failed: {}", cause);
//!             break;
//!         }
//!     }
//! }
//! manager.shutdown();
//! # }
//! ```

use crate::backend::BackendError;
use std::time::Duration;
use thiserror::Error;

mod feeder;
pub mod manager;
mod registry;
pub mod session;
pub mod status;
mod worker;

pub use manager::UploadManager;
pub use session::Upload;
pub use status::{UploadNotifier, UploadStatus};

/// Upload errors
///
/// Only [`UploadError::NotFound`], [`UploadError::OffsetMismatch`],
/// [`UploadError::Busy`] and [`UploadError::ShuttingDown`] are returned
/// synchronously from `resume`;
/// everything else arrives as [`UploadStatus::Error`] on the notifier.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload not found")]
    NotFound,

    #[error("upload initialization error: {0}")]
    Init(#[source] BackendError),

    #[error("upload part error: part {part_number}: {source}")]
    Part {
        part_number: u32,
        #[source]
        source: BackendError,
    },

    #[error("upload completion error: {0}")]
    Complete(#[source] BackendError),

    #[error("timeout: no data received for {0:?}")]
    Timeout(Duration),

    #[error("could not receive data for upload: {0}")]
    Read(#[source] std::io::Error),

    #[error("offset does not match uploaded status (expected {expected}, got {actual})")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("upload is still receiving data from another producer")]
    Busy,

    #[error("upload exceeds declared size: {received} of {expected} bytes")]
    SizeExceeded { expected: u64, received: u64 },

    #[error("upload cancelled")]
    Cancelled,

    #[error("upload manager is shutting down")]
    ShuttingDown,
}

impl UploadError {
    /// Whether the upload is still registered and can be continued with `resume`
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            UploadError::NotFound | UploadError::Init(_) | UploadError::ShuttingDown
        )
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::NotFound => "not_found",
            UploadError::Init(_) => "init",
            UploadError::Part { .. } => "part",
            UploadError::Complete(_) => "complete",
            UploadError::Timeout(_) => "timeout",
            UploadError::Read(_) => "read",
            UploadError::OffsetMismatch { .. } => "offset_mismatch",
            UploadError::Busy => "busy",
            UploadError::SizeExceeded { .. } => "size_exceeded",
            UploadError::Cancelled => "cancelled",
            UploadError::ShuttingDown => "shutting_down",
        }
    }
}

/// Number of parts needed for `total_size` bytes at `chunk_size` bytes per part
pub fn expected_parts(total_size: u64, chunk_size: usize) -> u64 {
    total_size.div_ceil(chunk_size.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_parts() {
        assert_eq!(expected_parts(300, 100), 3);
        assert_eq!(expected_parts(250, 100), 3);
        assert_eq!(expected_parts(1, 100), 1);
        assert_eq!(expected_parts(0, 100), 0);
    }

    #[test]
    fn test_resumable_classification() {
        assert!(!UploadError::NotFound.is_resumable());
        assert!(!UploadError::Init(BackendError::Rejected("denied".into())).is_resumable());
        assert!(UploadError::Timeout(Duration::from_secs(1)).is_resumable());
        assert!(UploadError::Part {
            part_number: 2,
            source: BackendError::Rejected("503".into())
        }
        .is_resumable());
        assert!(UploadError::Complete(BackendError::Rejected("500".into())).is_resumable());
        assert!(UploadError::Read(std::io::Error::other("reset")).is_resumable());
        assert!(UploadError::Busy.is_resumable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(UploadError::NotFound.to_string(), "upload not found");
        assert_eq!(
            UploadError::Init(BackendError::Rejected("no bucket".into())).to_string(),
            "upload initialization error: Backend rejected request: no bucket"
        );
        assert_eq!(
            UploadError::OffsetMismatch {
                expected: 100,
                actual: 50
            }
            .to_string(),
            "offset does not match uploaded status (expected 100, got 50)"
        );
    }
}
