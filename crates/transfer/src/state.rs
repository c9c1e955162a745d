use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Lifecycle of one transfer: `Start → Transferring → Done`, with
/// `Transferring → Aborted` on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Start,
    Transferring,
    Done,
    Aborted,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Done | TransferStatus::Aborted)
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("transfer of {name} already ended ({status:?})")]
    Terminal {
        name: String,
        status: TransferStatus,
    },

    #[error("transfer of {name} has not started")]
    NotStarted { name: String },
}

/// Progress of one transfer, owned by the driver running it.
///
/// `offset` counts the bytes the remote has confirmed. It only moves forward
/// after a chunk exchange succeeds.
#[derive(Debug, Clone)]
pub struct TransferState {
    name: String,
    direction: Direction,
    status: TransferStatus,
    offset: u64,
    total_bytes: Option<u64>,
    chunks: u64,
    started_at: Option<Instant>,
    error: Option<String>,
}

impl TransferState {
    /// Creates a transfer in the `Start` state.
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            status: TransferStatus::Start,
            offset: 0,
            total_bytes: None,
            chunks: 0,
            started_at: None,
            error: None,
        }
    }

    /// Moves to `Transferring`, starting from `offset` (0 unless resuming).
    pub fn begin(&mut self, offset: u64) -> Result<(), StateError> {
        self.ensure_live()?;
        self.status = TransferStatus::Transferring;
        self.offset = offset;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Records one confirmed chunk of `bytes` and returns the new offset.
    pub fn advance(&mut self, bytes: u64) -> Result<u64, StateError> {
        self.ensure_transferring()?;
        self.offset += bytes;
        self.chunks += 1;
        Ok(self.offset)
    }

    /// Sets the payload size once it is known.
    pub fn set_total(&mut self, total: u64) {
        self.total_bytes = Some(total);
    }

    /// Moves to `Done`.
    pub fn finish(&mut self) -> Result<(), StateError> {
        self.ensure_transferring()?;
        self.status = TransferStatus::Done;
        Ok(())
    }

    /// Moves to `Aborted`, keeping the reason for diagnostics.
    ///
    /// Aborting an already terminal transfer is a no-op.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TransferStatus::Aborted;
        self.error = Some(reason.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_done(&self) -> bool {
        self.status == TransferStatus::Done
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Fraction complete in `[0.0, 1.0]`, when the total is known.
    pub fn progress(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.offset as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// Seconds since `begin`.
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default()
    }

    fn ensure_live(&self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal {
                name: self.name.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_transferring(&self) -> Result<(), StateError> {
        self.ensure_live()?;
        if self.status == TransferStatus::Start {
            return Err(StateError::NotStarted {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}
