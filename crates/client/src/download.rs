//! Download driver: pulls a remote file into a local path chunk by chunk.
//!
//! The remote decides when the file is complete through the `done` flag. A
//! short chunk alone never ends the loop.

use std::path::{Path, PathBuf};

use canload_protocol::FileUploadRecord;
use canload_protocol::messages::{DownloadChunkRequest, FileDetailsRequest};
use canload_transfer::{
    Checkpoint, Direction, RunningDigest, SpeedCalculator, TransferState,
    calculate_file_checksum,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, chunk_len};
use crate::endpoint::TransferEndpoint;
use crate::error::TransferError;
use crate::events::TransferEvent;

/// Outcome of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub filename: String,
    pub local_path: PathBuf,
    /// Size of the local file, equal to the remote's size.
    pub bytes: u64,
    /// Chunks received by this run.
    pub chunks: u64,
    pub resumed_from: u64,
    /// Local digest, computed only when verification is enabled.
    pub filesha256: Option<String>,
}

/// Downloads files through a single endpoint.
pub struct DownloadDriver<'a> {
    endpoint: &'a dyn TransferEndpoint,
    config: &'a TransferConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl<'a> DownloadDriver<'a> {
    pub fn new(
        endpoint: &'a dyn TransferEndpoint,
        config: &'a TransferConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            config,
            cancel,
            events: None,
        }
    }

    /// Sends progress events to `tx` while transfers run.
    pub fn with_events(mut self, tx: mpsc::Sender<TransferEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Downloads `remote_name` into `local_path`, asking for `chunksize`
    /// bytes per request.
    pub async fn download(
        &self,
        remote_name: &str,
        local_path: &Path,
        chunksize: u64,
    ) -> Result<DownloadSummary, TransferError> {
        let mut state = TransferState::new(remote_name, Direction::Download);

        match self.run(remote_name, local_path, chunksize, &mut state).await {
            Ok(summary) => {
                info!(
                    name = remote_name,
                    path = %local_path.display(),
                    bytes = summary.bytes,
                    chunks = summary.chunks,
                    elapsed_secs = state.elapsed_secs(),
                    "download complete"
                );
                self.emit(TransferEvent::Completed {
                    name: remote_name.to_string(),
                    direction: Direction::Download,
                    bytes: summary.bytes,
                })
                .await;
                Ok(summary)
            }
            Err(e) => {
                state.abort(e.to_string());
                warn!(name = remote_name, offset = state.offset(), "download aborted: {e}");
                self.emit(TransferEvent::Failed {
                    name: remote_name.to_string(),
                    direction: Direction::Download,
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        remote_name: &str,
        local_path: &Path,
        chunksize: u64,
        state: &mut TransferState,
    ) -> Result<DownloadSummary, TransferError> {
        chunk_len(chunksize)?;
        check_destination(local_path).await?;
        let Resume {
            offset: resume_from,
            mut digest,
            remote,
        } = self.resume_point(remote_name, local_path).await?;
        let mut file = open_destination(local_path, resume_from).await?;

        self.check_cancelled(remote_name, resume_from)?;
        state.begin(resume_from)?;
        info!(
            name = remote_name,
            endpoint = self.endpoint.endpoint_id(),
            path = %local_path.display(),
            chunksize,
            resume_from,
            "download starting"
        );
        self.emit(TransferEvent::Started {
            name: remote_name.to_string(),
            direction: Direction::Download,
            total: None,
            resume_from,
        })
        .await;

        let policy = self.config.download_policy();
        let speed = SpeedCalculator::default();
        let mut offset = resume_from;
        let mut filesize: u64;

        loop {
            self.check_cancelled(remote_name, offset)?;

            let req = DownloadChunkRequest {
                filename: remote_name.to_string(),
                chunksize,
                offset,
                namespace: self.config.namespace,
            };
            let record = policy
                .call("download_chunk", &self.cancel, || self.endpoint.download_chunk(&req))
                .await
                .map_err(|e| TransferError::from_retry(e, "download_chunk", remote_name, offset))?
                .map_err(|source| TransferError::Api {
                    operation: "download_chunk",
                    name: remote_name.to_string(),
                    offset,
                    source,
                })?;

            if record.offset != offset {
                warn!(
                    name = remote_name,
                    requested = offset,
                    answered = record.offset,
                    "remote answered a different offset"
                );
            }
            filesize = record.filesize;
            state.set_total(filesize);

            if !record.chunk.is_empty() {
                file.write_all(&record.chunk)
                    .await
                    .map_err(|e| TransferError::io(local_path, e))?;
                let len = record.chunk.len() as u64;
                offset = state.advance(len)?;
                speed.add_sample(len);
                digest.update(&record.chunk);
                self.save_checkpoint(remote_name, local_path, &mut file, &digest, remote.as_ref())
                    .await?;
                debug!(name = remote_name, offset, filesize, done = record.done, "chunk received");

                self.emit(TransferEvent::Progress {
                    name: remote_name.to_string(),
                    direction: Direction::Download,
                    offset,
                    total: Some(filesize),
                    bytes_per_second: speed.bytes_per_second(),
                })
                .await;
            }

            if record.done {
                break;
            }
            if record.chunk.is_empty() {
                return Err(TransferError::Stalled {
                    name: remote_name.to_string(),
                    offset,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::io(local_path, e))?;
        drop(file);

        let actual = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| TransferError::io(local_path, e))?
            .len();
        if actual != filesize {
            return Err(TransferError::LengthMismatch {
                name: remote_name.to_string(),
                expected: filesize,
                actual,
            });
        }

        state.finish()?;
        if let Some(store) = &self.config.checkpoints {
            store.clear(&self.scope(), remote_name, Direction::Download)?;
        }

        let filesha256 = if self.config.verify_hash {
            Some(self.verify(remote_name, local_path, offset).await?)
        } else {
            None
        };

        Ok(DownloadSummary {
            filename: remote_name.to_string(),
            local_path: local_path.to_path_buf(),
            bytes: actual,
            chunks: state.chunks(),
            resumed_from: resume_from,
            filesha256,
        })
    }

    /// Hashes the local file and compares it with the remote's upload
    /// record, when the remote has one.
    async fn verify(
        &self,
        remote_name: &str,
        local_path: &Path,
        offset: u64,
    ) -> Result<String, TransferError> {
        let path = local_path.to_path_buf();
        let local = tokio::task::spawn_blocking(move || calculate_file_checksum(&path))
            .await
            .map_err(|e| TransferError::io(local_path, std::io::Error::other(e)))?
            .map_err(|e| TransferError::io(local_path, e))?;

        let req = FileDetailsRequest {
            filename: remote_name.to_string(),
            namespace: self.config.namespace,
        };
        let details = self
            .config
            .download_policy()
            .call("uploaded_file_details", &self.cancel, || {
                self.endpoint.uploaded_file_details(&req)
            })
            .await
            .map_err(|e| {
                TransferError::from_retry(e, "uploaded_file_details", remote_name, offset)
            })?;

        match details {
            Ok(record) if !record.filesha256.eq_ignore_ascii_case(&local) => {
                Err(TransferError::HashMismatch {
                    name: remote_name.to_string(),
                    local,
                    remote: record.filesha256,
                })
            }
            Ok(_) => {
                debug!(name = remote_name, "local digest matches remote record");
                Ok(local)
            }
            Err(e) => {
                warn!(name = remote_name, error = %e, "remote has no record to verify against");
                Ok(local)
            }
        }
    }

    /// Fetches the remote's current record of `remote_name`, or `None`
    /// when it has none.
    async fn remote_record(
        &self,
        remote_name: &str,
    ) -> Result<Option<FileUploadRecord>, TransferError> {
        let req = FileDetailsRequest {
            filename: remote_name.to_string(),
            namespace: self.config.namespace,
        };
        let details = self
            .config
            .download_policy()
            .call("uploaded_file_details", &self.cancel, || {
                self.endpoint.uploaded_file_details(&req)
            })
            .await
            .map_err(|e| TransferError::from_retry(e, "uploaded_file_details", remote_name, 0))?;
        match details {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                debug!(name = remote_name, error = %e, "remote has no record of the file");
                Ok(None)
            }
        }
    }

    /// Where to start a download. A checkpoint is only honoured when the
    /// remote record is the one it was saved against and the local file
    /// still holds exactly the bytes it covers; anything else restarts at 0.
    async fn resume_point(
        &self,
        remote_name: &str,
        local_path: &Path,
    ) -> Result<Resume, TransferError> {
        let Some(store) = &self.config.checkpoints else {
            return Ok(Resume::fresh(None));
        };
        let remote = self.remote_record(remote_name).await?;
        let Some(checkpoint) = store.load(&self.scope(), remote_name, Direction::Download)? else {
            return Ok(Resume::fresh(remote));
        };
        let offset = checkpoint.last_offset;

        let Some(current) = remote.as_ref() else {
            debug!(name = remote_name, offset, "no remote record to check checkpoint against, starting over");
            return Ok(Resume::fresh(remote));
        };
        if offset == 0 || !checkpoint.remote_matches(current.filesize, &current.filesha256) {
            warn!(
                name = remote_name,
                checkpoint = offset,
                remote = current.filesize,
                "remote file changed since checkpoint, starting over"
            );
            return Ok(Resume::fresh(remote));
        }

        match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.len() == offset => {}
            _ => {
                debug!(name = remote_name, offset, "local file does not match checkpoint, starting over");
                return Ok(Resume::fresh(remote));
            }
        }

        let path = local_path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || RunningDigest::from_file(&path))
            .await
            .map_err(|e| TransferError::io(local_path, std::io::Error::other(e)))?
            .map_err(|e| TransferError::io(local_path, e))?;
        if digest.len() != offset || !checkpoint.prefix_matches(&digest.hex()) {
            warn!(name = remote_name, offset, "local bytes differ from checkpoint, starting over");
            return Ok(Resume::fresh(remote));
        }

        info!(name = remote_name, offset, "resuming download from checkpoint");
        Ok(Resume {
            offset,
            digest,
            remote,
        })
    }

    async fn save_checkpoint(
        &self,
        remote_name: &str,
        local_path: &Path,
        file: &mut tokio::fs::File,
        digest: &RunningDigest,
        remote: Option<&FileUploadRecord>,
    ) -> Result<(), TransferError> {
        let Some(store) = &self.config.checkpoints else {
            return Ok(());
        };
        // The checkpoint must never run ahead of the bytes on disk.
        file.flush()
            .await
            .map_err(|e| TransferError::io(local_path, e))?;
        let mut checkpoint =
            Checkpoint::new(self.scope(), remote_name, Direction::Download, digest.len())
                .with_prefix(digest.hex());
        if let Some(record) = remote {
            checkpoint = checkpoint.with_remote(record.filesize, record.filesha256.clone());
        }
        store.save(&checkpoint)?;
        Ok(())
    }

    fn scope(&self) -> String {
        self.config.checkpoint_scope(self.endpoint.endpoint_id())
    }

    fn check_cancelled(&self, remote_name: &str, offset: u64) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled {
                name: remote_name.to_string(),
                offset,
            });
        }
        Ok(())
    }

    async fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Where a download starts and what is already known at that point.
struct Resume {
    offset: u64,
    /// Digest of the local bytes before `offset`.
    digest: RunningDigest,
    remote: Option<FileUploadRecord>,
}

impl Resume {
    fn fresh(remote: Option<FileUploadRecord>) -> Self {
        Self {
            offset: 0,
            digest: RunningDigest::new(),
            remote,
        }
    }
}

/// Checks that `path` can be created or replaced: its directory must exist
/// and be writable, and `path` itself must not be a directory.
pub async fn check_destination(path: &Path) -> Result<(), TransferError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = tokio::fs::metadata(parent)
        .await
        .map_err(|e| TransferError::io(parent, e))?;
    if !meta.is_dir() {
        return Err(TransferError::io(
            parent,
            std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
        ));
    }
    if meta.permissions().readonly() {
        return Err(TransferError::io(
            parent,
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "directory is read-only"),
        ));
    }
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        return Err(TransferError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::IsADirectory, "destination is a directory"),
        ));
    }
    Ok(())
}

/// Opens the destination, truncating it for a fresh download and
/// appending when resuming.
async fn open_destination(
    path: &Path,
    resume_from: u64,
) -> Result<tokio::fs::File, TransferError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true);
    if resume_from > 0 {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))
}
