//! Upload driver: sends a local file to a remote name, one chunk at a time.
//!
//! Chunks go out strictly in offset order and each one is confirmed before
//! the next is sent. The remote answers every chunk with the cumulative
//! size and digest of the file; the last answer is the result.

use std::path::Path;

use canload_protocol::FileUploadRecord;
use canload_protocol::messages::{FileDetailsRequest, LoadModelRequest, UploadChunkRequest};
use canload_transfer::{
    Checkpoint, ChunkIterator, Direction, RetryError, SpeedCalculator, TransferState,
    checksum_bytes,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, chunk_len};
use crate::endpoint::TransferEndpoint;
use crate::error::TransferError;
use crate::events::TransferEvent;

/// Uploads files through a single endpoint.
pub struct UploadDriver<'a> {
    endpoint: &'a dyn TransferEndpoint,
    config: &'a TransferConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl<'a> UploadDriver<'a> {
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

    /// Uploads `local_path` as `remote_name` in chunks of `chunksize` bytes.
    ///
    /// Returns the remote's record after the last chunk. Any failure aborts
    /// the whole upload; nothing is reported as partially done. Names that
    /// match an activation suffix are loaded as models afterwards.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        chunksize: u64,
    ) -> Result<FileUploadRecord, TransferError> {
        let mut state = TransferState::new(remote_name, Direction::Upload);

        match self.run(local_path, remote_name, chunksize, &mut state).await {
            Ok(record) => {
                info!(
                    name = remote_name,
                    bytes = record.filesize,
                    chunks = state.chunks(),
                    elapsed_secs = state.elapsed_secs(),
                    sha256 = %record.filesha256,
                    "upload complete"
                );
                self.emit(TransferEvent::Completed {
                    name: remote_name.to_string(),
                    direction: Direction::Upload,
                    bytes: record.filesize,
                })
                .await;
                Ok(record)
            }
            Err(e) => {
                state.abort(e.to_string());
                warn!(name = remote_name, offset = state.offset(), "upload aborted: {e}");
                self.emit(TransferEvent::Failed {
                    name: remote_name.to_string(),
                    direction: Direction::Upload,
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        local_path: &Path,
        remote_name: &str,
        chunksize: u64,
        state: &mut TransferState,
    ) -> Result<FileUploadRecord, TransferError> {
        let chunk_len = chunk_len(chunksize)?;
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransferError::io(local_path, e))?;
        if data.is_empty() {
            return Err(TransferError::EmptyPayload(local_path.to_path_buf()));
        }
        let total = data.len() as u64;
        state.set_total(total);

        self.check_cancelled(remote_name, 0)?;
        let resume_from = self.resume_offset(remote_name, &data).await?;
        state.begin(resume_from)?;

        info!(
            name = remote_name,
            endpoint = self.endpoint.endpoint_id(),
            bytes = total,
            chunksize,
            resume_from,
            "upload starting"
        );
        self.emit(TransferEvent::Started {
            name: remote_name.to_string(),
            direction: Direction::Upload,
            total: Some(total),
            resume_from,
        })
        .await;

        let chunks = ChunkIterator::new(&data, chunk_len)
            .and_then(|it| it.starting_at(resume_from))
            .map_err(|_| TransferError::InvalidChunkSize(chunksize))?;

        let speed = SpeedCalculator::default();
        let mut last = None;

        for chunk in chunks {
            self.check_cancelled(remote_name, chunk.offset)?;

            let req = UploadChunkRequest {
                filename: remote_name.to_string(),
                chunk: chunk.data.to_vec(),
                chunksize,
                offset: chunk.offset,
                namespace: self.config.namespace,
            };
            let record = self
                .config
                .retry
                .call("upload_chunk", &self.cancel, || self.endpoint.upload_chunk(&req))
                .await
                .map_err(|e| TransferError::from_retry(e, "upload_chunk", remote_name, chunk.offset))?
                .map_err(|source| TransferError::Api {
                    operation: "upload_chunk",
                    name: remote_name.to_string(),
                    offset: chunk.offset,
                    source,
                })?;

            if record.filesize != chunk.end() {
                warn!(
                    name = remote_name,
                    offset = chunk.offset,
                    expected = chunk.end(),
                    remote = record.filesize,
                    "remote size differs from bytes sent"
                );
            }

            let offset = state.advance(chunk.len() as u64)?;
            speed.add_sample(chunk.len() as u64);
            self.save_checkpoint(remote_name, offset, &data[..offset as usize], &record)?;
            debug!(name = remote_name, offset, filesize = record.filesize, "chunk accepted");

            self.emit(TransferEvent::Progress {
                name: remote_name.to_string(),
                direction: Direction::Upload,
                offset,
                total: Some(total),
                bytes_per_second: speed.bytes_per_second(),
            })
            .await;
            last = Some(record);
        }

        // resume_offset never skips the whole payload, so at least one
        // chunk was sent.
        let record = last.ok_or_else(|| TransferError::EmptyPayload(local_path.to_path_buf()))?;
        state.finish()?;
        if let Some(store) = &self.config.checkpoints {
            store.clear(&self.scope(), remote_name, Direction::Upload)?;
        }

        if self.config.verify_hash {
            let local = checksum_bytes(&data);
            if !local.eq_ignore_ascii_case(&record.filesha256) {
                return Err(TransferError::HashMismatch {
                    name: remote_name.to_string(),
                    local,
                    remote: record.filesha256,
                });
            }
            debug!(name = remote_name, "remote digest verified");
        }

        if self.config.namespace.is_files() && self.config.activation.applies_to(remote_name) {
            self.activate(remote_name, total).await?;
        }

        Ok(record)
    }

    /// Where to start an upload: the checkpointed offset when neither the
    /// local prefix nor the remote file changed since it was saved,
    /// otherwise 0.
    async fn resume_offset(&self, remote_name: &str, data: &[u8]) -> Result<u64, TransferError> {
        let Some(store) = &self.config.checkpoints else {
            return Ok(0);
        };
        let Some(checkpoint) = store.load(&self.scope(), remote_name, Direction::Upload)? else {
            return Ok(0);
        };
        let offset = checkpoint.last_offset;
        if offset == 0 || offset >= data.len() as u64 {
            debug!(name = remote_name, offset, "checkpoint not usable, starting over");
            return Ok(0);
        }
        let prefix = checksum_bytes(&data[..offset as usize]);
        if !checkpoint.prefix_matches(&prefix) {
            warn!(name = remote_name, offset, "local file changed since checkpoint, starting over");
            return Ok(0);
        }

        let req = FileDetailsRequest {
            filename: remote_name.to_string(),
            namespace: self.config.namespace,
        };
        let details = self
            .config
            .retry
            .call("uploaded_file_details", &self.cancel, || {
                self.endpoint.uploaded_file_details(&req)
            })
            .await
            .map_err(|e| TransferError::from_retry(e, "uploaded_file_details", remote_name, 0))?;

        match details {
            Ok(record)
                if record.filesize == offset
                    && record.filesha256.eq_ignore_ascii_case(&prefix)
                    && checkpoint.remote_matches(record.filesize, &record.filesha256) =>
            {
                info!(name = remote_name, offset, "resuming upload from checkpoint");
                Ok(offset)
            }
            Ok(record) => {
                warn!(
                    name = remote_name,
                    checkpoint = offset,
                    remote = record.filesize,
                    "remote file does not match checkpoint, starting over"
                );
                Ok(0)
            }
            Err(e) => {
                warn!(name = remote_name, error = %e, "no remote record to resume from, starting over");
                Ok(0)
            }
        }
    }

    /// Loads an uploaded model and waits for the remote to report ready.
    async fn activate(&self, remote_name: &str, offset: u64) -> Result<(), TransferError> {
        self.emit(TransferEvent::Activating {
            name: remote_name.to_string(),
        })
        .await;
        info!(name = remote_name, "loading model");

        let req = LoadModelRequest {
            args: vec!["--model".to_string(), remote_name.to_string()],
        };
        let loaded = self
            .config
            .retry
            .call("load_model", &self.cancel, || self.endpoint.activate(&req))
            .await;
        match loaded {
            Ok(Ok(record)) => {
                debug!(name = remote_name, status = record.status_code, output = %record.output, "model loaded");
            }
            Ok(Err(e)) => return Err(activation_failed(remote_name, "load_model", e)),
            Err(e @ RetryError::Cancelled { .. }) => {
                return Err(TransferError::from_retry(e, "load_model", remote_name, offset));
            }
            Err(e) => return Err(activation_failed(remote_name, "load_model", e)),
        }

        let ready = self
            .config
            .retry
            .call("ready", &self.cancel, || self.endpoint.ready())
            .await;
        match ready {
            Ok(Ok(status)) => {
                info!(name = remote_name, status = status.status_code, "remote ready");
                Ok(())
            }
            Ok(Err(e)) => Err(activation_failed(remote_name, "ready", e)),
            Err(e @ RetryError::Cancelled { .. }) => {
                Err(TransferError::from_retry(e, "ready", remote_name, offset))
            }
            Err(e) => Err(activation_failed(remote_name, "ready", e)),
        }
    }

    fn save_checkpoint(
        &self,
        remote_name: &str,
        offset: u64,
        sent: &[u8],
        record: &FileUploadRecord,
    ) -> Result<(), TransferError> {
        if let Some(store) = &self.config.checkpoints {
            let checkpoint = Checkpoint::new(self.scope(), remote_name, Direction::Upload, offset)
                .with_prefix(checksum_bytes(sent))
                .with_remote(record.filesize, record.filesha256.clone());
            store.save(&checkpoint)?;
        }
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

/// Checks that `path` is a readable regular file and returns its size.
pub async fn check_source(path: &Path) -> Result<u64, TransferError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    if !meta.is_file() {
        return Err(TransferError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(meta.len())
}

fn activation_failed(name: &str, step: &'static str, err: impl std::fmt::Display) -> TransferError {
    TransferError::Activation {
        name: name.to_string(),
        step,
        reason: err.to_string(),
    }
}
