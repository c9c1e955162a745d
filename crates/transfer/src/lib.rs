//! Building blocks for chunked transfers: splitting payloads into
//! offset-ordered chunks, retrying transient failures with a fixed backoff,
//! tracking per-transfer state and persisting resume checkpoints.

mod checkpoint;
mod chunking;
mod progress;
mod retry;
mod state;
mod validation;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use chunking::{
    Chunk, ChunkError, ChunkIterator, RunningDigest, calculate_file_checksum, checksum_bytes,
};
pub use progress::SpeedCalculator;
pub use retry::{RetryError, RetryPolicy, Transient};
pub use state::{Direction, StateError, TransferState, TransferStatus};
pub use validation::{InvalidName, validate_remote_name};
