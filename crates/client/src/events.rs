//! Progress events emitted by the drivers.

use canload_transfer::Direction;

/// Events emitted while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The transfer is starting, possibly from a resumed offset.
    Started {
        name: String,
        direction: Direction,
        total: Option<u64>,
        resume_from: u64,
    },
    /// A chunk was accepted.
    Progress {
        name: String,
        direction: Direction,
        offset: u64,
        total: Option<u64>,
        bytes_per_second: f64,
    },
    /// Upload complete; loading the model on the remote.
    Activating { name: String },
    Completed {
        name: String,
        direction: Direction,
        bytes: u64,
    },
    Failed {
        name: String,
        direction: Direction,
        error: String,
    },
}
