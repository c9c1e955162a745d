use serde::{Deserialize, Serialize};

/// Structured failure returned by a remote operation.
///
/// These are answers, not transport faults: the remote understood the
/// request and refused it. Retrying the same request cannot change the
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ApiError {
    #[error("Access Denied")]
    AccessDenied,

    #[error("status code {0}")]
    StatusCode(u16),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a remote operation, serialized as `{"Ok": ..}` / `{"Err": ..}`.
pub type ApiResult<T> = Result<T, ApiError>;

/// Which remote namespace a name refers to.
///
/// Plain files are addressed by their name as given. Prompt caches live
/// under a per-caller session directory that the remote resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    #[default]
    Files,
    PromptCache,
}

impl Namespace {
    pub fn is_files(&self) -> bool {
        matches!(self, Namespace::Files)
    }

    /// Wire spelling of the namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Files => "files",
            Namespace::PromptCache => "prompt_cache",
        }
    }
}

/// Cumulative state of a remote file after an accepted chunk.
///
/// `filesize` and `filesha256` describe everything stored under the name
/// so far, not just the last chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadRecord {
    pub filename: String,
    pub filesize: u64,
    pub filesha256: String,
}

/// One chunk read back from the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadRecord {
    #[serde(with = "crate::messages::base64_bytes")]
    pub chunk: Vec<u8>,
    /// Offset the chunk was read from.
    pub offset: u64,
    /// Total size of the remote file.
    pub filesize: u64,
    /// Length of `chunk`.
    pub chunksize: u64,
    /// `true` once this chunk reaches the end of the file.
    pub done: bool,
}

/// Plain status answer (`health`, `ready`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCodeRecord {
    pub status_code: u16,
}

/// Answer to a model load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadModelRecord {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}
