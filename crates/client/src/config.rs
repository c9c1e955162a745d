//! Transfer configuration passed into the drivers.

use canload_protocol::Namespace;
use canload_protocol::constants::MAX_CHUNK_SIZE;
use canload_transfer::{CheckpointStore, RetryPolicy};

use crate::error::TransferError;

/// Checks a requested chunk size against what the remote accepts.
pub(crate) fn chunk_len(chunksize: u64) -> Result<usize, TransferError> {
    if chunksize == 0 || chunksize > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidChunkSize(chunksize));
    }
    usize::try_from(chunksize).map_err(|_| TransferError::InvalidChunkSize(chunksize))
}

/// What happens after an upload completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationConfig {
    /// Set to `false` to never activate after upload.
    pub enabled: bool,
    /// Remote names ending with one of these are loaded as models.
    pub suffixes: Vec<String>,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suffixes: vec![".gguf".to_string()],
        }
    }
}

impl ActivationConfig {
    /// Returns `true` if uploading `remote_name` should trigger activation.
    pub fn applies_to(&self, remote_name: &str) -> bool {
        self.enabled && self.suffixes.iter().any(|s| remote_name.ends_with(s.as_str()))
    }
}

/// Settings shared by upload and download drivers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Applied to every remote call.
    pub retry: RetryPolicy,
    /// When `false`, download chunks are attempted once.
    pub retry_downloads: bool,
    pub activation: ActivationConfig,
    /// Compare the remote digest with the local payload after transfer.
    pub verify_hash: bool,
    pub namespace: Namespace,
    /// Enables resumable transfers when set.
    pub checkpoints: Option<CheckpointStore>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retry_downloads: true,
            activation: ActivationConfig::default(),
            verify_hash: false,
            namespace: Namespace::Files,
            checkpoints: None,
        }
    }
}

impl TransferConfig {
    /// Checkpoint scope for transfers through `endpoint_id`, so the same
    /// name on another remote or namespace never shares a checkpoint.
    pub(crate) fn checkpoint_scope(&self, endpoint_id: &str) -> String {
        format!("{endpoint_id}/{}", self.namespace.as_str())
    }

    pub(crate) fn download_policy(&self) -> RetryPolicy {
        if self.retry_downloads {
            self.retry.clone()
        } else {
            RetryPolicy::no_retry()
        }
    }
}
