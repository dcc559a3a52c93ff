//! Status channel protocol
//!
//! Every upload owns one bounded channel of [`UploadStatus`] events. Events are
//! delivered in production order; `Ok` or `Error` closes the current
//! start/resume round and nothing follows it until the next `resume`.
//!
//! Callers must drain the notifier until a terminal event. A notifier nobody
//! reads eventually fills up and stalls the worker, and failures that are
//! never read are failures nobody sees.

use super::UploadError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Message attached to a successful completion
pub const UPLOAD_COMPLETED: &str = "Upload completed";

/// Upload lifecycle event
#[derive(Debug)]
pub enum UploadStatus {
    /// Cumulative bytes acknowledged by the backend
    Progress { uploaded_bytes: u64 },
    /// Upload finished; no further events for this upload
    Ok { message: String },
    /// Upload stopped; see [`UploadError::is_resumable`]
    Error { cause: UploadError },
}

impl UploadStatus {
    pub fn completed() -> Self {
        UploadStatus::Ok {
            message: UPLOAD_COMPLETED.to_string(),
        }
    }

    pub fn error(cause: UploadError) -> Self {
        UploadStatus::Error { cause }
    }

    /// True for `Ok` and `Error`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::Progress { .. })
    }
}

/// Receiving side of an upload's status channel.
///
/// Cloning yields another handle to the same channel; `start` and every
/// `resume` of one upload return handles to a single channel.
#[derive(Clone)]
pub struct UploadNotifier {
    rx: Arc<Mutex<mpsc::Receiver<UploadStatus>>>,
}

impl UploadNotifier {
    /// Receive the next event
    ///
    /// Returns `None` once the upload has been dropped, which happens after it
    /// completes and every reference to it is gone.
    pub async fn recv(&self) -> Option<UploadStatus> {
        self.rx.lock().await.recv().await
    }

    /// Receive an event without waiting
    pub fn try_recv(&self) -> Option<UploadStatus> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Skip progress events and return the next `Ok` or `Error`
    pub async fn wait_terminal(&self) -> Option<UploadStatus> {
        while let Some(status) = self.recv().await {
            if status.is_terminal() {
                return Some(status);
            }
        }
        None
    }

    /// True if both handles read from the same channel
    pub fn same_channel(&self, other: &UploadNotifier) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl fmt::Debug for UploadNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadNotifier").finish_non_exhaustive()
    }
}

/// Sending side, owned by the upload
#[derive(Clone)]
pub(crate) struct StatusSender {
    tx: mpsc::Sender<UploadStatus>,
}

impl StatusSender {
    /// Send an event, waiting for buffer space unless `cancel` fires first.
    ///
    /// Returns false if the event was dropped.
    pub(crate) async fn send(&self, status: UploadStatus, cancel: &CancellationToken) -> bool {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.send_now(status),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(status);
                true
            }
            Err(_) => false,
        }
    }

    /// Best-effort send that never waits
    pub(crate) fn send_now(&self, status: UploadStatus) -> bool {
        match self.tx.try_send(status) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Dropped upload status event");
                false
            }
        }
    }
}

/// Create a status channel with room for `capacity` buffered events
pub(crate) fn channel(capacity: usize) -> (StatusSender, UploadNotifier) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StatusSender { tx },
        UploadNotifier {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}
