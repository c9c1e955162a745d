//! In-process endpoint backed directly by a [`Store`].

use std::sync::Arc;

use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, StatusCodeRecord,
};
use canload_store::Store;

use crate::endpoint::{EndpointError, EndpointFuture, TransferEndpoint};

/// Calls a store in the same process, on the blocking pool.
///
/// Never reports busy or timeouts; the only transport failure is a store
/// task that panicked.
pub struct LocalEndpoint {
    store: Arc<Store>,
    caller: Option<String>,
    id: String,
}

impl LocalEndpoint {
    pub fn new(store: Arc<Store>, caller: Option<String>) -> Self {
        let id = format!("local:{}", store.root().display());
        Self { store, caller, id }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    async fn run<Req, T, F>(&self, req: &Req, op: F) -> Result<ApiResult<T>, EndpointError>
    where
        Req: Clone + Send + 'static,
        T: Send + 'static,
        F: FnOnce(&Store, Option<&str>, &Req) -> ApiResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let caller = self.caller.clone();
        let req = req.clone();
        tokio::task::spawn_blocking(move || op(&store, caller.as_deref(), &req))
            .await
            .map_err(|e| EndpointError::Local(e.to_string()))
    }
}

impl TransferEndpoint for LocalEndpoint {
    fn upload_chunk<'a>(
        &'a self,
        req: &'a UploadChunkRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        Box::pin(self.run(req, |store, caller, req| store.upload_chunk(caller, req)))
    }

    fn download_chunk<'a>(
        &'a self,
        req: &'a DownloadChunkRequest,
    ) -> EndpointFuture<'a, FileDownloadRecord> {
        Box::pin(self.run(req, |store, caller, req| store.download_chunk(caller, req)))
    }

    fn uploaded_file_details<'a>(
        &'a self,
        req: &'a FileDetailsRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        Box::pin(self.run(req, |store, caller, req| {
            store.uploaded_file_details(caller, req)
        }))
    }

    fn activate<'a>(&'a self, req: &'a LoadModelRequest) -> EndpointFuture<'a, LoadModelRecord> {
        Box::pin(self.run(req, |store, caller, req| store.load_model(caller, req)))
    }

    fn ready(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        Box::pin(async move { Ok(self.store.ready()) })
    }

    fn health(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        Box::pin(async move { Ok(self.store.health()) })
    }

    fn endpoint_id(&self) -> &str {
        &self.id
    }
}
