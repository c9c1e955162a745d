//! Background tasks driving a client WebSocket connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use canload_protocol::envelope::Message;

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;

/// Requests waiting for a response, keyed by message id.
pub(crate) type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;
