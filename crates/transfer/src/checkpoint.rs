//! Resume checkpoints: the last confirmed offset of a named transfer,
//! persisted after every chunk so a restarted process can pick up where
//! the previous one stopped.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunking::checksum_bytes;
use crate::state::Direction;

/// Errors reading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Last confirmed position of a transfer.
///
/// `scope` names the remote and namespace the transfer ran against. The
/// digests let a resume prove that neither side changed since the save:
/// `prefix_sha256` covers the first `last_offset` local bytes, while
/// `remote_size` and `remote_sha256` describe the remote file as it was
/// then. Checkpoints written without them are never resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub scope: String,
    pub remote_name: String,
    pub direction: Direction,
    pub last_offset: u64,
    #[serde(default)]
    pub prefix_sha256: Option<String>,
    #[serde(default)]
    pub remote_size: Option<u64>,
    #[serde(default)]
    pub remote_sha256: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        scope: impl Into<String>,
        remote_name: impl Into<String>,
        direction: Direction,
        last_offset: u64,
    ) -> Self {
        Self {
            scope: scope.into(),
            remote_name: remote_name.into(),
            direction,
            last_offset,
            prefix_sha256: None,
            remote_size: None,
            remote_sha256: None,
            updated_at: Utc::now(),
        }
    }

    /// Records the digest of the local bytes before `last_offset`.
    pub fn with_prefix(mut self, sha256: impl Into<String>) -> Self {
        self.prefix_sha256 = Some(sha256.into());
        self
    }

    /// Records the remote file's size and digest.
    pub fn with_remote(mut self, size: u64, sha256: impl Into<String>) -> Self {
        self.remote_size = Some(size);
        self.remote_sha256 = Some(sha256.into());
        self
    }

    /// Returns `true` if the saved local prefix digest equals `sha256`.
    pub fn prefix_matches(&self, sha256: &str) -> bool {
        self.prefix_sha256
            .as_deref()
            .is_some_and(|saved| saved.eq_ignore_ascii_case(sha256))
    }

    /// Returns `true` if the saved remote state equals `size` and `sha256`.
    pub fn remote_matches(&self, size: u64, sha256: &str) -> bool {
        self.remote_size == Some(size)
            && self
                .remote_sha256
                .as_deref()
                .is_some_and(|saved| saved.eq_ignore_ascii_case(sha256))
    }
}

/// Directory of checkpoint files, one per `(scope, remote_name, direction)`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scopes and remote names may contain separators, so files are keyed
    /// by a digest of both.
    fn path_for(&self, scope: &str, remote_name: &str, direction: Direction) -> PathBuf {
        let key = checksum_bytes(format!("{scope}\n{remote_name}").as_bytes());
        self.dir.join(format!("{}-{direction}.json", &key[..16]))
    }

    /// Returns the checkpoint for a transfer, if one was saved.
    pub fn load(
        &self,
        scope: &str,
        remote_name: &str,
        direction: Direction,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(scope, remote_name, direction);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .map_err(|source| CheckpointError::Corrupt { path, source })?;

        // A truncated key can collide; never resume someone else's file.
        if checkpoint.scope != scope || checkpoint.remote_name != remote_name {
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// Persists a checkpoint, replacing any previous one atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(
            &checkpoint.scope,
            &checkpoint.remote_name,
            checkpoint.direction,
        );
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!(
            scope = %checkpoint.scope,
            name = %checkpoint.remote_name,
            offset = checkpoint.last_offset,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Removes a checkpoint. Missing checkpoints are not an error.
    pub fn clear(
        &self,
        scope: &str,
        remote_name: &str,
        direction: Direction,
    ) -> Result<(), CheckpointError> {
        match std::fs::remove_file(self.path_for(scope, remote_name, direction)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCOPE: &str = "ws://127.0.0.1:8080/files";

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(
            store
                .load(SCOPE, "models/model.gguf", Direction::Upload)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested"));
        let cp = Checkpoint::new(SCOPE, "models/model.gguf", Direction::Upload, 4_000_000)
            .with_prefix("aa")
            .with_remote(4_000_000, "aa");
        store.save(&cp).unwrap();

        let loaded = store
            .load(SCOPE, "models/model.gguf", Direction::Upload)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, cp);

        // Directions are tracked separately.
        assert!(
            store
                .load(SCOPE, "models/model.gguf", Direction::Download)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn scopes_do_not_share_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store
            .save(&Checkpoint::new("ws://a:1/files", "x.bin", Direction::Download, 5))
            .unwrap();

        assert!(store.load("ws://b:1/files", "x.bin", Direction::Download).unwrap().is_none());
        assert!(
            store
                .load("ws://a:1/prompt_cache", "x.bin", Direction::Download)
                .unwrap()
                .is_none()
        );
        assert!(store.load("ws://a:1/files", "x.bin", Direction::Download).unwrap().is_some());
    }

    #[test]
    fn save_overwrites_previous_offset() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&Checkpoint::new(SCOPE, "a", Direction::Download, 5)).unwrap();
        store.save(&Checkpoint::new(SCOPE, "a", Direction::Download, 10)).unwrap();
        let loaded = store.load(SCOPE, "a", Direction::Download).unwrap().unwrap();
        assert_eq!(loaded.last_offset, 10);
    }

    #[test]
    fn clear_removes_and_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&Checkpoint::new(SCOPE, "a", Direction::Upload, 5)).unwrap();
        store.clear(SCOPE, "a", Direction::Upload).unwrap();
        assert!(store.load(SCOPE, "a", Direction::Upload).unwrap().is_none());
        store.clear(SCOPE, "a", Direction::Upload).unwrap();
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.path_for(SCOPE, "a", Direction::Upload);
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            store.load(SCOPE, "a", Direction::Upload),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn matching_requires_saved_digests() {
        let bare = Checkpoint::new(SCOPE, "a", Direction::Download, 5);
        assert!(!bare.prefix_matches("abc"));
        assert!(!bare.remote_matches(10, "def"));

        let full = bare.with_prefix("ABC").with_remote(10, "def");
        assert!(full.prefix_matches("abc"));
        assert!(full.remote_matches(10, "DEF"));
        assert!(!full.remote_matches(11, "def"));
        assert!(!full.remote_matches(10, "xyz"));
    }
}
