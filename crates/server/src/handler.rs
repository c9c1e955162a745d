//! Handler trait for processing requests, and the store-backed handler.
//!
//! The server framework handles connections, routing and the in-flight
//! limit; implementors provide the answers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use canload_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_IMPLEMENTED,
};
use canload_protocol::envelope::Message;
use canload_protocol::messages::{
    DownloadChunkRequest, FileDetailsRequest, LoadModelRequest, UploadChunkRequest,
};
use canload_protocol::ApiResult;
use canload_store::Store;

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn not_implemented(sender: Sender, msg: Message) -> HandlerFuture<'static> {
    Box::pin(async move {
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
    })
}

/// Trait for handling requests from a client.
///
/// Each method receives a `sender` to reply through and the parsed
/// envelope. Default implementations reply with "not implemented" so
/// handlers only override the request types they serve.
pub trait Handler: Send + Sync + 'static {
    /// Called for `health`.
    fn on_health(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `ready`.
    fn on_ready(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `upload_chunk`.
    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `download_chunk`.
    fn on_download_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `uploaded_file_details`.
    fn on_uploaded_file_details(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }

    /// Called for `load_model`.
    fn on_load_model(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        not_implemented(sender, msg)
    }
}

/// Serves requests from a [`Store`].
///
/// Store operations block on disk I/O, so they run on the blocking pool.
pub struct StoreHandler {
    store: Arc<Store>,
}

impl StoreHandler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Parses the request payload, runs `op` against the store and replies
    /// with the operation's `ApiResult`.
    async fn serve<Req, T, F>(&self, sender: Sender, msg: Message, op: F)
    where
        Req: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        F: FnOnce(&Store, Option<&str>, &Req) -> ApiResult<T> + Send + 'static,
    {
        let Some(response_type) = msg.msg_type.response() else {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
            return;
        };

        let req: Req = match msg.parse_payload::<Req>() {
            Ok(Some(r)) => r,
            Ok(None) => {
                let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
                return;
            }
            Err(e) => {
                tracing::warn!(id = %msg.id, msg_type = ?msg.msg_type, "invalid payload: {e}");
                let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, &format!("invalid payload: {e}"));
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let caller = msg.caller.clone();
        let joined =
            tokio::task::spawn_blocking(move || op(&store, caller.as_deref(), &req)).await;

        let result = match joined {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(id = %msg.id, "store task failed: {e}");
                let _ = sender.send_error(&msg, WS_ERR_CODE_INTERNAL, "store task failed");
                return;
            }
        };

        if let Err(e) = &result {
            tracing::debug!(id = %msg.id, msg_type = ?msg.msg_type, error = %e, "request refused");
        }
        reply(&sender, &msg, response_type, &result);
    }
}

fn reply<T: Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, result: &ApiResult<T>) {
    match msg.reply(msg_type, Some(result)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => {
            tracing::error!(id = %msg.id, "failed to encode reply: {e}");
            let _ = sender.send_error(msg, WS_ERR_CODE_INTERNAL, "failed to encode reply");
        }
    }
}

impl Handler for StoreHandler {
    fn on_health(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            reply(&sender, &msg, MessageType::HealthResponse, &self.store.health());
        })
    }

    fn on_ready(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            reply(&sender, &msg, MessageType::ReadyResponse, &self.store.ready());
        })
    }

    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.serve(sender, msg, |store, caller, req: &UploadChunkRequest| {
            store.upload_chunk(caller, req)
        }))
    }

    fn on_download_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.serve(sender, msg, |store, caller, req: &DownloadChunkRequest| {
            store.download_chunk(caller, req)
        }))
    }

    fn on_uploaded_file_details(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.serve(sender, msg, |store, caller, req: &FileDetailsRequest| {
            store.uploaded_file_details(caller, req)
        }))
    }

    fn on_load_model(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(self.serve(sender, msg, |store, caller, req: &LoadModelRequest| {
            store.load_model(caller, req)
        }))
    }
}
