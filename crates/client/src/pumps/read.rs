//! WebSocket read pump: routes responses to waiting requests.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use canload_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use canload_protocol::envelope::Message;

use super::Pending;

/// Reads messages from the WebSocket and hands each response to the
/// request waiting for its id.
///
/// Any incoming frame resets a [`WS_PONG_WAIT`] deadline; if it expires the
/// connection is considered dead. On exit the connection is cancelled and
/// every waiting request is released, so callers see it closed at once.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Pending,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("no frames within {WS_PONG_WAIT:?}, connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                route_response(&text, &pending).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    // Dropping the senders wakes every waiter with a closed channel.
    pending.lock().await.clear();
}

/// Delivers a response to its pending request.
async fn route_response(text: &str, pending: &Pending) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    let sender = pending.lock().await.remove(&msg.id);
    match sender {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => {
            debug!(msg_type = ?msg.msg_type, id = %msg.id, "response for unknown or expired request");
        }
    }
}
