//! WebSocket endpoint for a remote store server.
//!
//! Implements request-response with UUID correlation over one connection.
//! The connection is opened on first use and reopened on the next request
//! after it drops, so a retried call gets a fresh connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use canload_protocol::constants::{
    MessageType, WS_CHUNK_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use canload_protocol::envelope::Message;
use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::{
    ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, StatusCodeRecord,
};

use crate::endpoint::{EndpointError, EndpointFuture, TransferEndpoint};
use crate::pumps::{self, Pending};

/// One live WebSocket connection and its pump tasks.
struct WsConnection {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
}

impl WsConnection {
    async fn open(url: &str) -> Result<Self, EndpointError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false)
                .await
                .map_err(|e| EndpointError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(pumps::ping::ping_pump(write_tx.clone(), cancel.clone()));

        Ok(Self {
            write_tx,
            pending,
            cancel,
            read_handle,
            write_handle,
            ping_handle,
        })
    }

    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.write_tx.is_closed()
    }

    /// Sends a request and waits up to `timeout` for its response.
    async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
        caller: Option<&str>,
        timeout: Duration,
    ) -> Result<Message, EndpointError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = Message::new(&id, msg_type, payload)?;
        if let Some(caller) = caller {
            msg = msg.with_caller(caller);
        }
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(EndpointError::Closed);
        }

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(EndpointError::Closed),
            Err(_) => Err(EndpointError::Timeout),
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

/// Endpoint that talks to a store server over WebSocket.
pub struct WsEndpoint {
    url: String,
    caller: Option<String>,
    conn: Mutex<Option<Arc<WsConnection>>>,
}

impl WsEndpoint {
    /// Creates an endpoint for `url`. No connection is made until the first
    /// request or [`connect`](Self::connect).
    pub fn new(url: impl Into<String>, caller: Option<String>) -> Self {
        Self {
            url: url.into(),
            caller,
            conn: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the connection now, if it is not already open.
    pub async fn connect(&self) -> Result<(), EndpointError> {
        self.connection().await.map(|_| ())
    }

    /// Closes the connection. The next request reconnects.
    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.cancel.cancel();
        }
    }

    async fn connection(&self) -> Result<Arc<WsConnection>, EndpointError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_alive() {
                return Ok(Arc::clone(conn));
            }
            debug!(url = %self.url, "connection lost, reconnecting");
        }

        let conn = Arc::new(WsConnection::open(&self.url).await?);
        info!(url = %self.url, "connected");
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Forgets `conn` so the next request opens a new connection.
    async fn discard(&self, conn: &Arc<WsConnection>) {
        let mut slot = self.conn.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            conn.cancel.cancel();
            *slot = None;
        }
    }

    async fn request<Req, T>(
        &self,
        msg_type: MessageType,
        payload: Option<&Req>,
        timeout: Duration,
    ) -> Result<ApiResult<T>, EndpointError>
    where
        Req: Serialize + Sync,
        T: DeserializeOwned,
    {
        let expected = msg_type
            .response()
            .ok_or(EndpointError::UnexpectedResponse(msg_type))?;
        let conn = self.connection().await?;

        let result = conn
            .send_request(msg_type, payload, self.caller.as_deref(), timeout)
            .await;
        if matches!(result, Err(EndpointError::Closed | EndpointError::Timeout)) {
            self.discard(&conn).await;
        }
        let mut resp = result?;

        if let Some(err) = resp.error.take() {
            return Err(if err.is_busy() {
                EndpointError::Busy(err.message)
            } else {
                EndpointError::Remote {
                    code: err.code,
                    message: err.message,
                }
            });
        }
        if resp.msg_type != expected {
            return Err(EndpointError::UnexpectedResponse(resp.msg_type));
        }
        resp.parse_payload::<ApiResult<T>>()?
            .ok_or(EndpointError::EmptyResponse)
    }
}

impl TransferEndpoint for WsEndpoint {
    fn upload_chunk<'a>(
        &'a self,
        req: &'a UploadChunkRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        Box::pin(self.request(MessageType::UploadChunk, Some(req), WS_CHUNK_REQUEST_TIMEOUT))
    }

    fn download_chunk<'a>(
        &'a self,
        req: &'a DownloadChunkRequest,
    ) -> EndpointFuture<'a, FileDownloadRecord> {
        Box::pin(self.request(MessageType::DownloadChunk, Some(req), WS_CHUNK_REQUEST_TIMEOUT))
    }

    fn uploaded_file_details<'a>(
        &'a self,
        req: &'a FileDetailsRequest,
    ) -> EndpointFuture<'a, FileUploadRecord> {
        Box::pin(self.request(MessageType::UploadedFileDetails, Some(req), WS_REQUEST_TIMEOUT))
    }

    fn activate<'a>(&'a self, req: &'a LoadModelRequest) -> EndpointFuture<'a, LoadModelRecord> {
        // Loading a large model takes as long as writing a chunk.
        Box::pin(self.request(MessageType::LoadModel, Some(req), WS_CHUNK_REQUEST_TIMEOUT))
    }

    fn ready(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        Box::pin(self.request::<(), _>(MessageType::Ready, None, WS_REQUEST_TIMEOUT))
    }

    fn health(&self) -> EndpointFuture<'_, StatusCodeRecord> {
        Box::pin(self.request::<(), _>(MessageType::Health, None, WS_REQUEST_TIMEOUT))
    }

    fn endpoint_id(&self) -> &str {
        &self.url
    }
}
