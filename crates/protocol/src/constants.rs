use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Time to wait for any incoming frame before the peer is considered dead.
///
/// Chunk writes on the remote side can be slow for multi-megabyte chunks,
/// so this is generous.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (16 MB).
///
/// A 2 MiB chunk grows by a third once base64 encoded; this leaves headroom.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for small request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for chunk uploads and downloads.
pub const WS_CHUNK_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest chunk the remote accepts in a single message (2 MiB).
pub const MAX_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Default chunk size used by the client (2,000,000 bytes).
pub const DEFAULT_CHUNK_SIZE: u64 = 2_000_000;

/// Longest remote name accepted.
pub const MAX_FILENAME_SIZE: usize = 4096;

/// Principal used when a request carries no caller identity.
pub const ANONYMOUS_CALLER: &str = "2vxsx-fae";

/// Directory holding per-caller prompt caches on the remote.
pub const CANISTER_CACHE_DIR: &str = ".canister_cache";

/// WebSocket message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests
    #[serde(rename = "health")]
    Health,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "download_chunk")]
    DownloadChunk,
    #[serde(rename = "uploaded_file_details")]
    UploadedFileDetails,
    #[serde(rename = "load_model")]
    LoadModel,

    // Responses
    #[serde(rename = "health_response")]
    HealthResponse,
    #[serde(rename = "ready_response")]
    ReadyResponse,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "download_chunk_response")]
    DownloadChunkResponse,
    #[serde(rename = "uploaded_file_details_response")]
    UploadedFileDetailsResponse,
    #[serde(rename = "load_model_response")]
    LoadModelResponse,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns the response type paired with a request type.
    pub fn response(self) -> Option<MessageType> {
        match self {
            MessageType::Health => Some(MessageType::HealthResponse),
            MessageType::Ready => Some(MessageType::ReadyResponse),
            MessageType::UploadChunk => Some(MessageType::UploadChunkResponse),
            MessageType::DownloadChunk => Some(MessageType::DownloadChunkResponse),
            MessageType::UploadedFileDetails => Some(MessageType::UploadedFileDetailsResponse),
            MessageType::LoadModel => Some(MessageType::LoadModelResponse),
            _ => None,
        }
    }
}

/// Envelope-level error codes. These describe the transport, never the
/// outcome of a remote operation.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
/// The remote is temporarily saturated; the request may be retried.
pub const WS_ERR_CODE_BUSY: i32 = 503;
