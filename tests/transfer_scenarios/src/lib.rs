//! Fixtures shared by the transfer scenarios: stores on temporary
//! directories, an endpoint that fails on demand and a server handler that
//! answers busy before serving.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use canload_client::{EndpointError, EndpointFuture, TransferEndpoint};
use canload_protocol::constants::WS_ERR_CODE_BUSY;
use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    FileDownloadRecord, FileUploadRecord, LoadModelRecord, Message, StatusCodeRecord,
};
use canload_server::{Handler, HandlerFuture, Sender, ServerConfig, StoreHandler, StoreServer};
use canload_store::{Store, StoreConfig};

/// Caller identity used by every scenario.
pub const CALLER: &str = "scenario-principal";

/// Opens a store with no admin list under `root`.
pub fn open_store(root: &Path) -> Arc<Store> {
    let store = Store::open(StoreConfig {
        root: root.to_path_buf(),
        admins: Vec::new(),
    })
    .expect("open store");
    Arc::new(store)
}

/// Which calls a [`FlakyEndpoint`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Upload,
    Download,
}

/// Wraps an endpoint and fails the first `failures` chunk calls of one
/// kind with a timeout, without reaching the inner endpoint.
pub struct FlakyEndpoint<E> {
    inner: E,
    fail_on: FailOn,
    remaining: AtomicU32,
    attempts: AtomicU32,
}

impl<E: TransferEndpoint> FlakyEndpoint<E> {
    pub fn new(inner: E, fail_on: FailOn, failures: u32) -> Self {
        Self {
            inner,
            fail_on,
            remaining: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Chunk calls of the failing kind made so far, failed or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self, kind: FailOn) -> bool {
        if kind != self.fail_on {
            return false;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<E: TransferEndpoint> TransferEndpoint for FlakyEndpoint<E> {
    fn upload_chunk<'a>(
        &'a self,
        req: &'a UploadChunkRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        if self.should_fail(FailOn::Upload) {
            return Box::pin(async { Err(EndpointError::Timeout) });
        }
        self.inner.upload_chunk(req)
    }

    fn download_chunk<'a>(
        &'a self,
        req: &'a DownloadChunkRequest,
    ) -> EndpointFuture<'a, FileDownloadRecord> {
        if self.should_fail(FailOn::Download) {
            return Box::pin(async { Err(EndpointError::Timeout) });
        }
        self.inner.download_chunk(req)
    }

    fn uploaded_file_details<'a>(
        &'a self,
        req: &'a FileDetailsRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        self.inner.uploaded_file_details(req)
    }

    fn activate<'a>(&'a self, req: &'a LoadModelRequest) -> EndpointFuture<'a, LoadModelRecord> {
        self.inner.activate(req)
    }

    fn ready(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        self.inner.ready()
    }

    fn health(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        self.inner.health()
    }

    fn endpoint_id(&self) -> &str {
        self.inner.endpoint_id()
    }
}

/// Answers the first `busy` upload requests with a busy envelope error,
/// then serves everything from the store.
pub struct BusyFirstHandler {
    inner: StoreHandler,
    remaining: AtomicU32,
    refused: AtomicU32,
}

impl BusyFirstHandler {
    pub fn new(store: Arc<Store>, busy: u32) -> Self {
        Self {
            inner: StoreHandler::new(store),
            remaining: AtomicU32::new(busy),
            refused: AtomicU32::new(0),
        }
    }

    /// Upload requests answered with busy so far.
    pub fn refused(&self) -> u32 {
        self.refused.load(Ordering::SeqCst)
    }
}

impl Handler for BusyFirstHandler {
    fn on_health(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        self.inner.on_health(sender, msg)
    }

    fn on_ready(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        self.inner.on_ready(sender, msg)
    }

    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        let busy = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Box::pin(async move {
                let _ = sender.send_error(&msg, WS_ERR_CODE_BUSY, "server busy");
            });
        }
        self.inner.on_upload_chunk(sender, msg)
    }

    fn on_download_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        self.inner.on_download_chunk(sender, msg)
    }

    fn on_uploaded_file_details(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        self.inner.on_uploaded_file_details(sender, msg)
    }

    fn on_load_model(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        self.inner.on_load_model(sender, msg)
    }
}

/// Starts `handler` on an OS-assigned localhost port and returns the
/// server with its `ws://` URL once it is listening.
pub async fn start_server<H: Handler>(handler: H) -> (Arc<StoreServer<H>>, String) {
    let server = StoreServer::new(ServerConfig::default(), handler);
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = running.run().await {
            tracing::error!("scenario server failed: {e}");
        }
    });

    for _ in 0..200 {
        if let Some(addr) = server.local_addr().await {
            return (server, format!("ws://{addr}"));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scenario server did not start listening");
}

/// Deterministic, non-repeating payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
