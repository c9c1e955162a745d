//! Scripted endpoint for driver tests.

use std::sync::Mutex;

use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, StatusCodeRecord,
};

use crate::endpoint::{EndpointError, EndpointFuture, TransferEndpoint};

type Scripted<T> = Mutex<Vec<Result<ApiResult<T>, EndpointError>>>;

/// Answers each operation from its own queue, in push order.
pub(crate) struct MockEndpoint {
    id: String,
    uploads: Scripted<FileUploadRecord>,
    downloads: Scripted<FileDownloadRecord>,
    details: Scripted<FileUploadRecord>,
    activations: Scripted<LoadModelRecord>,
    readiness: Scripted<StatusCodeRecord>,
    health: Scripted<StatusCodeRecord>,
    calls: Mutex<Vec<&'static str>>,
    pub upload_requests: Mutex<Vec<UploadChunkRequest>>,
    pub download_requests: Mutex<Vec<DownloadChunkRequest>>,
    pub activate_requests: Mutex<Vec<LoadModelRequest>>,
}

fn pop<T>(queue: &Scripted<T>, op: &str) -> Result<ApiResult<T>, EndpointError> {
    let mut queue = queue.lock().unwrap();
    if queue.is_empty() {
        Err(EndpointError::Local(format!("no scripted {op} response")))
    } else {
        queue.remove(0)
    }
}

impl MockEndpoint {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            uploads: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            details: Mutex::new(Vec::new()),
            activations: Mutex::new(Vec::new()),
            readiness: Mutex::new(Vec::new()),
            health: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            upload_requests: Mutex::new(Vec::new()),
            download_requests: Mutex::new(Vec::new()),
            activate_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_upload(&self, r: Result<ApiResult<FileUploadRecord>, EndpointError>) {
        self.uploads.lock().unwrap().push(r);
    }

    pub fn push_download(&self, r: Result<ApiResult<FileDownloadRecord>, EndpointError>) {
        self.downloads.lock().unwrap().push(r);
    }

    pub fn push_details(&self, r: Result<ApiResult<FileUploadRecord>, EndpointError>) {
        self.details.lock().unwrap().push(r);
    }

    pub fn push_activate(&self, r: Result<ApiResult<LoadModelRecord>, EndpointError>) {
        self.activations.lock().unwrap().push(r);
    }

    pub fn push_ready(&self, r: Result<ApiResult<StatusCodeRecord>, EndpointError>) {
        self.readiness.lock().unwrap().push(r);
    }

    pub fn push_health(&self, r: Result<ApiResult<StatusCodeRecord>, EndpointError>) {
        self.health.lock().unwrap().push(r);
    }

    /// Number of calls made to the named operation.
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }
}

impl TransferEndpoint for MockEndpoint {
    fn upload_chunk<'a>(
        &'a self,
        req: &'a UploadChunkRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        self.record("upload_chunk");
        self.upload_requests.lock().unwrap().push(req.clone());
        Box::pin(async move { pop(&self.uploads, "upload_chunk") })
    }

    fn download_chunk<'a>(
        &'a self,
        req: &'a DownloadChunkRequest,
    ) -> EndpointFuture<'a, FileDownloadRecord> {
        self.record("download_chunk");
        self.download_requests.lock().unwrap().push(req.clone());
        Box::pin(async move { pop(&self.downloads, "download_chunk") })
    }

    fn uploaded_file_details<'a>(
        &'a self,
        _req: &'a FileDetailsRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        self.record("uploaded_file_details");
        Box::pin(async move { pop(&self.details, "uploaded_file_details") })
    }

    fn activate<'a>(&'a self, req: &'a LoadModelRequest) -> EndpointFuture<'a, LoadModelRecord> {
        self.record("load_model");
        self.activate_requests.lock().unwrap().push(req.clone());
        Box::pin(async move { pop(&self.activations, "load_model") })
    }

    fn ready(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        self.record("ready");
        Box::pin(async move { pop(&self.readiness, "ready") })
    }

    fn health(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        self.record("health");
        Box::pin(async move { pop(&self.health, "health") })
    }

    fn endpoint_id(&self) -> &str {
        &self.id
    }
}
