//! Producer side of the part queue
//!
//! Reads the caller's stream until a full chunk has been collected (or the
//! stream ends) and pushes it onto the upload's part queue. Reads of any size
//! are coalesced, so every chunk except the last one of a stream is exactly
//! `chunk_size` bytes long.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Item on the part queue
#[derive(Debug)]
pub(crate) enum Feed {
    Chunk(Bytes),
    /// The reader failed; no more data follows from this feeder
    Failed(io::Error),
    EndOfStream,
}

pub(crate) async fn run<R>(
    mut reader: R,
    chunk_size: usize,
    parts: mpsc::Sender<Feed>,
    accepted: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let chunk_size = chunk_size.max(1);

    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let filled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = fill_chunk(&mut reader, &mut buf, chunk_size) => result,
        };

        let eof = match filled {
            Ok(eof) => eof,
            Err(e) => {
                // Bytes read before the error are dropped; the resume offset
                // only ever covers whole queued chunks.
                tracing::debug!(error = %e, "Upload stream failed");
                push(&parts, Feed::Failed(e), &cancel).await;
                return;
            }
        };

        if !buf.is_empty() {
            let len = buf.len() as u64;
            if !push(&parts, Feed::Chunk(buf.freeze()), &cancel).await {
                return;
            }
            accepted.fetch_add(len, Ordering::SeqCst);
            tracing::trace!(bytes = len, "Queued chunk");
        }

        if eof {
            push(&parts, Feed::EndOfStream, &cancel).await;
            return;
        }
    }
}

/// Read until `buf` holds `chunk_size` bytes or the stream ends.
/// Returns true on end-of-stream.
async fn fill_chunk<R>(reader: &mut R, buf: &mut BytesMut, chunk_size: usize) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < chunk_size {
        let remaining = chunk_size - buf.len();
        let n = reader.read_buf(&mut (&mut *buf).limit(remaining)).await?;
        if n == 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn push(parts: &mpsc::Sender<Feed>, item: Feed, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        result = parts.send(item) => result.is_ok(),
    }
}
