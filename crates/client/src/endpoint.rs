//! Abstraction over the remote service.
//!
//! Every operation answers `Result<ApiResult<T>, EndpointError>`. The outer
//! error is the transport (busy, timeout, dropped connection) and may be
//! retried; the inner [`ApiError`](canload_protocol::ApiError) is the
//! remote's own verdict and never is.

use std::future::Future;
use std::pin::Pin;

use canload_protocol::constants::MessageType;
use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, StatusCodeRecord,
};
use canload_transfer::{RetryPolicy, Transient};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Transport failures talking to an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The remote is temporarily overloaded.
    #[error("endpoint busy: {0}")]
    Busy(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote rejected the envelope itself (malformed, unknown type).
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("unexpected response type {0:?}")]
    UnexpectedResponse(MessageType),

    #[error("response carried no payload")]
    EmptyResponse,

    #[error("local store task failed: {0}")]
    Local(String),
}

impl Transient for EndpointError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            EndpointError::Busy(_)
                | EndpointError::Timeout
                | EndpointError::Closed
                | EndpointError::Connect { .. }
                | EndpointError::WebSocket(_)
        )
    }
}

/// A boxed future returned by endpoint methods.
pub type EndpointFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<ApiResult<T>, EndpointError>> + Send + 'a>>;

/// Operations the drivers need from a remote.
///
/// This trait is object-safe so drivers can hold `&dyn TransferEndpoint`.
pub trait TransferEndpoint: Send + Sync {
    /// Appends one chunk at `req.offset` and returns the cumulative record.
    fn upload_chunk<'a>(
        &'a self,
        req: &'a UploadChunkRequest,
    ) -> EndpointFuture<'a, FileUploadRecord>;

    /// Reads up to `req.chunksize` bytes starting at `req.offset`.
    fn download_chunk<'a>(
        &'a self,
        req: &'a DownloadChunkRequest,
    ) -> EndpointFuture<'a, FileDownloadRecord>;

    /// Returns the last record stored for a file.
    fn uploaded_file_details<'a>(
        &'a self,
        req: &'a FileDetailsRequest,
    ) -> EndpointFuture<'a, FileUploadRecord>;

    /// Loads a model with the given arguments.
    fn activate<'a>(&'a self, req: &'a LoadModelRequest) -> EndpointFuture<'a, LoadModelRecord>;

    fn ready(&self) -> EndpointFuture<'_, StatusCodeRecord>;

    fn health(&self) -> EndpointFuture<'_, StatusCodeRecord>;

    /// Identifies the endpoint in logs and events.
    fn endpoint_id(&self) -> &str;
}

/// Checks that the endpoint is alive before starting a transfer.
pub async fn check_health(
    endpoint: &dyn TransferEndpoint,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<StatusCodeRecord, TransferError> {
    let endpoint_id = endpoint.endpoint_id();
    let result = policy
        .call("health", cancel, || endpoint.health())
        .await
        .map_err(|e| TransferError::from_retry(e, "health", endpoint_id, 0))?;

    match result {
        Ok(status) => {
            tracing::debug!(endpoint = endpoint_id, status = status.status_code, "endpoint healthy");
            Ok(status)
        }
        Err(source) => Err(TransferError::Api {
            operation: "health",
            name: endpoint_id.to_string(),
            offset: 0,
            source,
        }),
    }
}
