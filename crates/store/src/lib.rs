//! Reference implementation of the remote side of the canload protocol.
//!
//! Files are kept under a root directory, one upload session per name, with
//! a streaming SHA-256 so every accepted chunk is answered with the
//! cumulative size and digest of the file. Prompt caches are resolved into
//! per-caller directories. A JSON index of the last record per file is kept
//! next to the data.

mod metadata;
mod paths;
mod store;

use std::path::PathBuf;

pub use metadata::METADATA_FILE;
pub use store::{Store, StoreConfig};

/// Errors opening a store.
///
/// Failures of individual operations are answered as
/// [`ApiError`](canload_protocol::ApiError) values instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt metadata index {path}: {source}")]
    CorruptMetadata {
        path: PathBuf,
        source: serde_json::Error,
    },
}
