//! WebSocket server for the canload protocol.
//!
//! Accepts any number of client connections, dispatches JSON requests to a
//! [`Handler`] and bounds how many requests are served at once. Requests over
//! the limit get an envelope error with code 503, which clients retry.

mod connection;
mod handler;
mod server;

pub use connection::{ClientConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture, StoreHandler};
pub use server::{ServerConfig, StoreServer};

/// Send buffer capacity per connection.
///
/// Download replies carry up to one base64-encoded chunk each, and a client
/// may pipeline requests, so the buffer holds a comfortable backlog.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the store server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
