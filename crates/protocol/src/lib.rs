//! Wire protocol for canload chunked file transfers.
//!
//! Every request and response travels inside a JSON [`Message`] envelope.
//! Remote operations answer with an [`ApiResult`], serialized as
//! `{"Ok": ...}` or `{"Err": ...}`, so protocol failures stay distinct from
//! transport failures carried in the envelope's `error` field.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{EnvelopeError, Message};
pub use types::{
    ApiError, ApiResult, FileDownloadRecord, FileUploadRecord, LoadModelRecord, Namespace,
    StatusCodeRecord,
};
