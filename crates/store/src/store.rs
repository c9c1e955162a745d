//! The store itself: upload sessions, chunk reads and model activation.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use canload_protocol::constants::MAX_CHUNK_SIZE;
use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    ApiError, ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, Namespace,
    StatusCodeRecord,
};

use crate::StoreError;
use crate::metadata::MetadataIndex;
use crate::paths::{self, Resolved};

const NOT_READY: &str = "Model not yet uploaded or initialize endpoint not yet called";
const MODEL_LOADED: &str = "Model successfully loaded into memory.";

/// Store configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Directory all files are stored under.
    pub root: PathBuf,
    /// Callers allowed to write plain files and load models. When empty,
    /// every identified (non-anonymous) caller is allowed.
    pub admins: Vec<String>,
}

/// In-flight upload of one file.
///
/// `hasher` has seen exactly the first `size` bytes of the file, so its
/// digest is the cumulative SHA-256 reported after each chunk.
#[derive(Default)]
struct UploadSession {
    loaded: bool,
    last_offset: Option<u64>,
    size: u64,
    hasher: Sha256,
}

impl UploadSession {
    fn record(&self, key: &str) -> FileUploadRecord {
        FileUploadRecord {
            filename: key.to_string(),
            filesize: self.size,
            filesha256: hex::encode(self.hasher.clone().finalize()),
        }
    }

    /// Rebuilds the session from the bytes already on disk, for uploads
    /// that continue after a store restart.
    fn recover(&mut self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        *self = UploadSession {
            loaded: true,
            last_offset: None,
            size,
            hasher,
        };
        Ok(())
    }
}

/// Filesystem-backed store answering the remote operations.
///
/// Operations are synchronous and may block on disk I/O; async callers
/// run them on the blocking pool.
pub struct Store {
    root: PathBuf,
    admins: HashSet<String>,
    sessions: Mutex<HashMap<String, Arc<Mutex<UploadSession>>>>,
    metadata: Mutex<MetadataIndex>,
    loaded_model: Mutex<Option<String>>,
    ready: AtomicBool,
}

// Guarded data stays consistent across a panic in another thread, so a
// poisoned lock is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn io_error(op: &str, key: &str, e: std::io::Error) -> ApiError {
    ApiError::Other(format!("{op}: {key}: {e}"))
}

impl Store {
    /// Opens (creating if needed) a store rooted at `config.root`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.root)?;
        let metadata = MetadataIndex::load(&config.root)?;
        info!(
            root = %config.root.display(),
            files = metadata.len(),
            admins = config.admins.len(),
            "store opened"
        );
        Ok(Self {
            root: config.root,
            admins: config.admins.into_iter().collect(),
            sessions: Mutex::new(HashMap::new()),
            metadata: Mutex::new(metadata),
            loaded_model: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the currently loaded model, if any.
    pub fn loaded_model(&self) -> Option<String> {
        lock(&self.loaded_model).clone()
    }

    fn authorize(&self, caller: Option<&str>, namespace: Namespace) -> ApiResult<()> {
        let Some(caller) = caller.filter(|_| !paths::is_anonymous(caller)) else {
            return Err(ApiError::AccessDenied);
        };
        if namespace.is_files() && !self.admins.is_empty() && !self.admins.contains(caller) {
            warn!(caller, "caller is not an admin");
            return Err(ApiError::AccessDenied);
        }
        Ok(())
    }

    fn session(&self, key: &str) -> Arc<Mutex<UploadSession>> {
        lock(&self.sessions)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Writes one chunk and returns the cumulative record of the file.
    ///
    /// Offset 0 starts the file over. Repeating the offset of the last
    /// accepted chunk is answered with the current record and writes
    /// nothing, so a retried request whose first answer was lost is safe.
    /// Any other offset must equal the number of bytes stored so far.
    pub fn upload_chunk(
        &self,
        caller: Option<&str>,
        req: &UploadChunkRequest,
    ) -> ApiResult<FileUploadRecord> {
        self.authorize(caller, req.namespace)?;

        if req.chunksize > MAX_CHUNK_SIZE {
            return Err(ApiError::Other(format!(
                "upload_chunk: chunksize {} exceeds limit {MAX_CHUNK_SIZE}",
                req.chunksize
            )));
        }
        let len = req.chunk.len() as u64;
        if len > req.chunksize {
            return Err(ApiError::Other(format!(
                "upload_chunk: chunk of {len} bytes exceeds declared chunksize {}",
                req.chunksize
            )));
        }

        let target = paths::resolve(&self.root, req.namespace, caller, &req.filename)?;
        let session = self.session(&target.key);
        let mut session = lock(&session);

        if req.offset == 0 {
            *session = UploadSession {
                loaded: true,
                ..Default::default()
            };
        } else if !session.loaded {
            session.recover(&target.path).map_err(|e| {
                ApiError::Other(format!(
                    "upload_chunk: no upload in progress for {} ({e}); start at offset 0",
                    target.key
                ))
            })?;
            debug!(name = %target.key, size = session.size, "recovered upload session from disk");
        }

        if session.last_offset == Some(req.offset) {
            debug!(name = %target.key, offset = req.offset, "chunk already handled");
            return Ok(session.record(&target.key));
        }

        if req.offset != session.size {
            return Err(ApiError::Other(format!(
                "upload_chunk: offset {} does not match the {} bytes stored for {}",
                req.offset, session.size, target.key
            )));
        }

        let filesize = req.offset.checked_add(len).ok_or_else(|| {
            ApiError::Other("upload_chunk: integer overflow in filesize calculation".into())
        })?;

        write_at(&target, req.offset, &req.chunk)
            .map_err(|e| io_error("upload_chunk", &target.key, e))?;

        session.hasher.update(&req.chunk);
        session.size = filesize;
        session.last_offset = Some(req.offset);
        let record = session.record(&target.key);

        lock(&self.metadata)
            .upsert(record.clone())
            .map_err(|e| ApiError::Other(format!("upload_chunk: {}: {e}", target.key)))?;

        debug!(
            name = %record.filename,
            offset = req.offset,
            filesize = record.filesize,
            filesha256 = %record.filesha256,
            "chunk stored"
        );
        Ok(record)
    }

    /// Returns the last record written for a file.
    pub fn uploaded_file_details(
        &self,
        caller: Option<&str>,
        req: &FileDetailsRequest,
    ) -> ApiResult<FileUploadRecord> {
        self.authorize(caller, req.namespace)?;
        let target = paths::resolve(&self.root, req.namespace, caller, &req.filename)?;
        lock(&self.metadata)
            .get(&target.key)
            .cloned()
            .ok_or_else(|| {
                ApiError::Other(format!("uploaded_file_details: {} not found", target.key))
            })
    }

    /// Reads up to `chunksize` bytes starting at `offset`.
    ///
    /// `done` is set once `offset + chunksize` reaches the file size.
    pub fn download_chunk(
        &self,
        caller: Option<&str>,
        req: &DownloadChunkRequest,
    ) -> ApiResult<FileDownloadRecord> {
        if req.chunksize == 0 || req.chunksize > MAX_CHUNK_SIZE {
            return Err(ApiError::Other(format!(
                "download_chunk: chunksize {} must be between 1 and {MAX_CHUNK_SIZE}",
                req.chunksize
            )));
        }
        let target = paths::resolve(&self.root, req.namespace, caller, &req.filename)?;

        let mut file = std::fs::File::open(&target.path)
            .map_err(|e| io_error("download_chunk", &target.key, e))?;
        let filesize = file
            .metadata()
            .map_err(|e| io_error("download_chunk", &target.key, e))?
            .len();

        let mut chunk = Vec::new();
        if req.offset < filesize {
            file.seek(SeekFrom::Start(req.offset))
                .and_then(|_| file.take(req.chunksize).read_to_end(&mut chunk))
                .map_err(|e| io_error("download_chunk", &target.key, e))?;
        }

        let done = req.offset.saturating_add(req.chunksize) >= filesize;
        debug!(
            name = %target.key,
            offset = req.offset,
            len = chunk.len(),
            filesize,
            done,
            "chunk read"
        );

        Ok(FileDownloadRecord {
            chunksize: chunk.len() as u64,
            chunk,
            offset: req.offset,
            filesize,
            done,
        })
    }

    /// Loads the model named by `--model` (or `-m`) and marks the store ready.
    pub fn load_model(
        &self,
        caller: Option<&str>,
        req: &LoadModelRequest,
    ) -> ApiResult<LoadModelRecord> {
        self.authorize(caller, Namespace::Files)?;

        let name = model_arg(&req.args).ok_or_else(|| {
            ApiError::Other("load_model: --model not provided in args".into())
        })?;
        let target = paths::resolve(&self.root, Namespace::Files, caller, name)?;

        let uploaded = lock(&self.metadata).get(&target.key).is_some();
        if !uploaded || !target.path.is_file() {
            return Err(ApiError::Other(format!(
                "load_model: {} has not been uploaded",
                target.key
            )));
        }

        *lock(&self.loaded_model) = Some(target.key.clone());
        self.ready.store(true, Ordering::SeqCst);
        info!(model = %target.key, "model loaded");

        Ok(LoadModelRecord {
            status_code: 200,
            output: MODEL_LOADED.into(),
        })
    }

    /// Readiness: `Ok` once a model has been loaded.
    pub fn ready(&self) -> ApiResult<StatusCodeRecord> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(StatusCodeRecord { status_code: 200 })
        } else {
            Err(ApiError::Other(NOT_READY.into()))
        }
    }

    /// Liveness.
    pub fn health(&self) -> ApiResult<StatusCodeRecord> {
        Ok(StatusCodeRecord { status_code: 200 })
    }
}

fn write_at(target: &Resolved, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = if offset == 0 {
        if let Some(parent) = target.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target.path)?
    } else {
        OpenOptions::new().write(true).open(&target.path)?
    };
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()
}

fn model_arg(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--model=") {
            return Some(value);
        }
        if arg == "--model" || arg == "-m" {
            return iter.next().map(String::as_str);
        }
    }
    None
}
