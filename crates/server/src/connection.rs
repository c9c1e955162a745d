//! Client connection management: read/write pumps, ping/pong, send buffering
//! and the in-flight request limit.

use std::net::SocketAddr;
use std::sync::Arc;

use canload_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_BUSY, WS_ERR_CODE_NOT_IMPLEMENTED,
    WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use canload_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Handle for sending messages to a connected client.
///
/// Cloneable and cheap, wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` only if the channel is full or closed.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a client; the read/write pumps run as background
/// tasks.
pub struct ClientConnection {
    pub remote_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the connection has ended, for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the connection is
/// closed or the server's cancel token is triggered. `limiter` is shared by
/// every connection of the server.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    limiter: Arc<Semaphore>,
    server_cancel: CancellationToken,
) -> ClientConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = ClientConnection {
        remote_addr,
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, sender, handler, limiter, read_cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        read_cancel.cancel();
        tracing::info!(%remote_addr, "client disconnected");
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches requests.
///
/// Any incoming frame resets the liveness deadline; a client silent for
/// [`WS_PONG_WAIT`] is dropped.
async fn read_pump<S, H>(
    mut stream: S,
    sender: Sender,
    handler: Arc<H>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                tracing::warn!("client silent too long, closing connection");
                break;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match ws_msg {
                    WsMessage::Text(text) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        dispatch_text(&handler, &sender, &limiter, &text);
                    }
                    WsMessage::Binary(_) => {
                        tracing::warn!("binary frames are not part of the protocol, ignoring");
                    }
                    WsMessage::Ping(data) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => {
                        tracing::info!("received close frame");
                        break;
                    }
                    WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

/// Parses a request and runs its handler on its own task.
///
/// Each request holds one permit of `limiter` while it runs. When none is
/// left the request is answered at once with a busy error, which clients
/// treat as transient.
fn dispatch_text<H: Handler>(
    handler: &Arc<H>,
    sender: &Sender,
    limiter: &Arc<Semaphore>,
    text: &str,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            // Answer with the id when one can be recovered.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(text)
                && let Some(id) = value.get("id").and_then(|v| v.as_str())
            {
                let _ = sender.send_msg(Message::error(
                    id,
                    WS_ERR_CODE_BAD_REQUEST,
                    format!("malformed message: {e}"),
                ));
            }
            return;
        }
    };

    if msg.msg_type.response().is_none() {
        tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
        let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
        return;
    }

    let permit = match Arc::clone(limiter).try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(id = %msg.id, msg_type = ?msg.msg_type, "too many requests in flight");
            let _ = sender.send_error(&msg, WS_ERR_CODE_BUSY, "server busy");
            return;
        }
    };

    let handler = Arc::clone(handler);
    let s = sender.clone();
    tokio::spawn(async move {
        let _permit = permit;
        match msg.msg_type {
            MessageType::Health => handler.on_health(s, msg).await,
            MessageType::Ready => handler.on_ready(s, msg).await,
            MessageType::UploadChunk => handler.on_upload_chunk(s, msg).await,
            MessageType::DownloadChunk => handler.on_download_chunk(s, msg).await,
            MessageType::UploadedFileDetails => handler.on_uploaded_file_details(s, msg).await,
            MessageType::LoadModel => handler.on_load_model(s, msg).await,
            _ => {
                let _ = s.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type");
            }
        }
    });
}
