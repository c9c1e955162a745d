//! Client side of canload: endpoints that speak the remote protocol and
//! the drivers that move whole files through them chunk by chunk.
//!
//! Drivers only depend on the [`TransferEndpoint`] trait. The binary wires
//! a [`WsEndpoint`] for remote targets; tests and local tooling use a
//! [`LocalEndpoint`] over an in-process store.
//!
//! # Pipeline
//!
//! 1. **Chunk**: split the payload (or request ranges) by offset
//! 2. **Exchange**: send each chunk through the retry policy
//! 3. **Verify**: compare sizes and, optionally, digests
//! 4. **Activate**: load uploaded models and wait for readiness

pub mod config;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod local;
pub(crate) mod pumps;
pub mod upload;
pub mod ws;

#[cfg(test)]
pub(crate) mod mock;

// Re-export primary types for convenience.
pub use config::{ActivationConfig, TransferConfig};
pub use download::{DownloadDriver, DownloadSummary, check_destination};
pub use endpoint::{EndpointError, EndpointFuture, TransferEndpoint, check_health};
pub use error::TransferError;
pub use events::TransferEvent;
pub use local::LocalEndpoint;
pub use upload::{UploadDriver, check_source};
pub use ws::WsEndpoint;
