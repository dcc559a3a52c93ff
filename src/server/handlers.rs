//! Request handlers for the upload endpoint

use crate::upload::{UploadError, UploadManager, UploadNotifier, UploadStatus};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyStream, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

/// Declared total size of an upload
pub const UPLOAD_LENGTH: &str = "upload-length";
/// Byte offset a resumed body starts at
pub const UPLOAD_OFFSET: &str = "upload-offset";

const UPLOADS_PREFIX: &str = "/uploads/";

/// JSON body returned by PUT and PATCH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// `completed` or `error`
    pub status: String,
    /// Bytes acknowledged by the backend
    pub uploaded: u64,
    /// Whether a PATCH can continue the upload
    pub resumable: bool,
    pub message: String,
}

pub(crate) async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<UploadManager>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == "/health" && method == Method::GET {
        return Ok(text(StatusCode::OK, "ok"));
    }

    let Some(identifier) = path.strip_prefix(UPLOADS_PREFIX).map(str::to_string) else {
        return Ok(text(StatusCode::NOT_FOUND, "Not Found"));
    };
    if identifier.is_empty() {
        return Ok(text(StatusCode::BAD_REQUEST, "Missing upload identifier"));
    }

    let response = match method {
        Method::PUT => start(req, &identifier, &manager).await,
        Method::PATCH => resume(req, &identifier, &manager).await,
        Method::HEAD => offset(&identifier, &manager),
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    };

    info!(
        method = %method,
        identifier = %identifier,
        status = response.status().as_u16(),
        "Handled upload request"
    );
    Ok(response)
}

async fn start(
    req: Request<Incoming>,
    identifier: &str,
    manager: &UploadManager,
) -> Response<Full<Bytes>> {
    let total_size = match header_u64(req.headers(), UPLOAD_LENGTH) {
        Ok(size) => size,
        Err(response) => return response,
    };

    let notifier = manager.start(identifier, total_size, body_reader(req)).await;
    finish_round(&notifier, 0).await
}

async fn resume(
    req: Request<Incoming>,
    identifier: &str,
    manager: &UploadManager,
) -> Response<Full<Bytes>> {
    let offset = match header_u64(req.headers(), UPLOAD_OFFSET) {
        Ok(offset) => offset,
        Err(response) => return response,
    };

    let reader = body_reader(req);
    let result = match offset {
        Some(offset) => manager.resume_from(identifier, offset, reader).await,
        None => manager.resume(identifier, reader).await,
    };

    match result {
        Ok(notifier) => {
            let uploaded = manager
                .get_incomplete_upload(identifier)
                .map(|upload| upload.uploaded_bytes())
                .unwrap_or_default();
            finish_round(&notifier, uploaded).await
        }
        Err(cause) => {
            warn!(identifier = %identifier, error = %cause, "Resume rejected");
            let uploaded = match &cause {
                UploadError::OffsetMismatch { expected, .. } => *expected,
                UploadError::Busy => manager
                    .get_incomplete_upload(identifier)
                    .map(|upload| upload.accepted_bytes())
                    .unwrap_or_default(),
                _ => 0,
            };
            upload_error(&cause, uploaded)
        }
    }
}

/// `Upload-Offset` is the offset the next PATCH has to send; after a failed
/// round it equals the bytes the backend acknowledged.
fn offset(identifier: &str, manager: &UploadManager) -> Response<Full<Bytes>> {
    let Some(upload) = manager.get_incomplete_upload(identifier) else {
        return empty(StatusCode::NOT_FOUND);
    };

    let mut response = empty(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(upload.accepted_bytes()));
    if let Some(total) = upload.total_size() {
        headers.insert(UPLOAD_LENGTH, HeaderValue::from(total));
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Wait for the terminal event of the current round
async fn finish_round(notifier: &UploadNotifier, mut uploaded: u64) -> Response<Full<Bytes>> {
    while let Some(status) = notifier.recv().await {
        match status {
            UploadStatus::Progress { uploaded_bytes } => uploaded = uploaded_bytes,
            UploadStatus::Ok { message } => {
                return json(
                    StatusCode::CREATED,
                    &UploadResponse {
                        status: "completed".into(),
                        uploaded,
                        resumable: false,
                        message,
                    },
                )
            }
            UploadStatus::Error { cause } => return upload_error(&cause, uploaded),
        }
    }
    upload_error(&UploadError::Cancelled, uploaded)
}

fn upload_error(cause: &UploadError, uploaded: u64) -> Response<Full<Bytes>> {
    json(
        status_code(cause),
        &UploadResponse {
            status: "error".into(),
            uploaded,
            resumable: cause.is_resumable(),
            message: cause.to_string(),
        },
    )
}

/// HTTP status for an upload error
pub(crate) fn status_code(cause: &UploadError) -> StatusCode {
    match cause {
        UploadError::NotFound => StatusCode::NOT_FOUND,
        UploadError::OffsetMismatch { .. } | UploadError::Busy => StatusCode::CONFLICT,
        UploadError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        UploadError::Read(_) => StatusCode::BAD_REQUEST,
        UploadError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::Init(_) | UploadError::Part { .. } | UploadError::Complete(_) => {
            StatusCode::BAD_GATEWAY
        }
        UploadError::Cancelled | UploadError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Expose a request body as an `AsyncRead` of its data frames
fn body_reader(req: Request<Incoming>) -> impl tokio::io::AsyncRead + Send + Unpin + 'static {
    let stream = BodyStream::new(req.into_body())
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .map_err(io::Error::other);
    StreamReader::new(Box::pin(stream))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, Response<Full<Bytes>>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| text(StatusCode::BAD_REQUEST, &format!("Invalid {} header", name)))
}

fn json(status: StatusCode, body: &UploadResponse) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => with_body(status, "application/json", Bytes::from(bytes)),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    with_body(status, "text/plain", Bytes::from(body.to_string()))
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn with_body(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
