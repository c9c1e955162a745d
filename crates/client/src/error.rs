//! Transfer error types.

use std::path::PathBuf;

use canload_protocol::ApiError;
use canload_protocol::constants::MAX_CHUNK_SIZE;
use canload_transfer::{CheckpointError, RetryError, StateError};

use crate::endpoint::EndpointError;

/// Errors that end an upload or download.
///
/// Remote-call variants carry the operation, the remote name and the offset
/// the transfer had reached.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is empty; nothing to upload", .0.display())]
    EmptyPayload(PathBuf),

    #[error("invalid chunk size {0} (must be between 1 and {MAX_CHUNK_SIZE})")]
    InvalidChunkSize(u64),

    /// Every attempt failed with a transient transport error.
    #[error("{operation} of {name} failed at offset {offset} after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        name: String,
        offset: u64,
        attempts: u32,
        source: EndpointError,
    },

    /// A transport error that retrying cannot fix.
    #[error("{operation} of {name} failed at offset {offset} on attempt {attempt}: {source}")]
    Endpoint {
        operation: &'static str,
        name: String,
        offset: u64,
        attempt: u32,
        source: EndpointError,
    },

    /// The remote refused the request.
    #[error("{operation} of {name} refused at offset {offset}: {source}")]
    Api {
        operation: &'static str,
        name: String,
        offset: u64,
        source: ApiError,
    },

    #[error("download of {name} stalled at offset {offset}: empty chunk before completion")]
    Stalled { name: String, offset: u64 },

    #[error("downloaded {actual} bytes of {name} but the remote reports {expected}")]
    LengthMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("digest mismatch for {name}: local {local}, remote {remote}")]
    HashMismatch {
        name: String,
        local: String,
        remote: String,
    },

    #[error("activation of {name} failed during {step}: {reason}")]
    Activation {
        name: String,
        step: &'static str,
        reason: String,
    },

    #[error("{name} cancelled at offset {offset}")]
    Cancelled { name: String, offset: u64 },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("transfer state error: {0}")]
    State(#[from] StateError),
}

impl TransferError {
    /// Wraps a failed retried call with the transfer's position.
    pub(crate) fn from_retry(
        err: RetryError<EndpointError>,
        operation: &'static str,
        name: &str,
        offset: u64,
    ) -> Self {
        let name = name.to_string();
        match err {
            RetryError::Exhausted {
                attempts, source, ..
            } => TransferError::RetriesExhausted {
                operation,
                name,
                offset,
                attempts,
                source,
            },
            RetryError::Fatal {
                attempt, source, ..
            } => TransferError::Endpoint {
                operation,
                name,
                offset,
                attempt,
                source,
            },
            RetryError::Cancelled { .. } => TransferError::Cancelled { name, offset },
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    /// Offset the transfer had reached, for errors raised mid-transfer.
    pub fn offset(&self) -> Option<u64> {
        match self {
            TransferError::RetriesExhausted { offset, .. }
            | TransferError::Endpoint { offset, .. }
            | TransferError::Api { offset, .. }
            | TransferError::Stalled { offset, .. }
            | TransferError::Cancelled { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Attempts spent on the failing call, when a remote call failed.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            TransferError::RetriesExhausted { attempts, .. } => Some(*attempts),
            TransferError::Endpoint { attempt, .. } => Some(*attempt),
            TransferError::Api { .. } => Some(1),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_retry_keeps_position() {
        let err = TransferError::from_retry(
            RetryError::Exhausted {
                operation: "upload_chunk".into(),
                attempts: 5,
                source: EndpointError::Timeout,
            },
            "upload_chunk",
            "model.gguf",
            4_000_000,
        );
        assert!(matches!(err, TransferError::RetriesExhausted { .. }));
        assert_eq!(err.offset(), Some(4_000_000));
        assert_eq!(err.attempts(), Some(5));
        let text = err.to_string();
        assert!(text.contains("model.gguf"));
        assert!(text.contains("4000000"));
        assert!(text.contains("5 attempts"));
    }

    #[test]
    fn fatal_retry_is_an_endpoint_error() {
        let err = TransferError::from_retry(
            RetryError::Fatal {
                operation: "download_chunk".into(),
                attempt: 1,
                source: EndpointError::EmptyResponse,
            },
            "download_chunk",
            "a.bin",
            10,
        );
        assert!(matches!(err, TransferError::Endpoint { attempt: 1, .. }));
    }

    #[test]
    fn cancelled_retry_maps_to_cancelled() {
        let err = TransferError::from_retry(
            RetryError::Cancelled {
                operation: "upload_chunk".into(),
                attempt: 2,
            },
            "upload_chunk",
            "a.bin",
            7,
        );
        assert!(err.is_cancelled());
        assert_eq!(err.offset(), Some(7));
    }

    #[test]
    fn api_error_is_reported_verbatim() {
        let err = TransferError::Api {
            operation: "download_chunk",
            name: "a.bin".into(),
            offset: 0,
            source: ApiError::Other("download_chunk: a.bin not found".into()),
        };
        assert!(err.to_string().contains("download_chunk: a.bin not found"));
    }
}
