use std::io::Read;
use std::iter::FusedIterator;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Errors produced while setting up chunking.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("offset {offset} is past the end of a {len}-byte payload")]
    OffsetOutOfRange { offset: u64, len: u64 },
}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a growing prefix, updated chunk by chunk.
#[derive(Debug, Clone, Default)]
pub struct RunningDigest {
    hasher: Sha256,
    len: u64,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes everything currently in `path`.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut digest = Self::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        Ok(digest)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex digest of the bytes hashed so far.
    pub fn hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

// ---------------------------------------------------------------------------
// ChunkIterator
// ---------------------------------------------------------------------------

/// A contiguous slice of a payload, tagged with where it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Byte offset of `data` within the payload.
    pub offset: u64,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset just past this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Splits a payload into fixed-size chunks in increasing offset order.
///
/// Every chunk but the last is exactly `chunk_size` bytes. An empty payload
/// yields nothing, and a payload that is an exact multiple of the chunk size
/// does not yield a trailing empty chunk.
#[derive(Debug, Clone)]
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
}

impl<'a> ChunkIterator<'a> {
    /// Creates an iterator over `data`. `chunk_size` must be positive.
    pub fn new(data: &'a [u8], chunk_size: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize);
        }
        Ok(Self {
            data,
            chunk_size,
            offset: 0,
        })
    }

    /// Skips the first `offset` bytes (for resume).
    ///
    /// `offset` may equal the payload length, in which case nothing is left.
    pub fn starting_at(mut self, offset: u64) -> Result<Self, ChunkError> {
        let len = self.data.len() as u64;
        if offset > len {
            return Err(ChunkError::OffsetOutOfRange { offset, len });
        }
        self.offset = offset as usize;
        Ok(self)
    }

    /// Offset of the next chunk.
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Bytes not yet yielded.
    pub fn remaining_bytes(&self) -> u64 {
        (self.data.len() - self.offset) as u64
    }

    /// Length of the whole payload.
    pub fn total_len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = self.data.len().min(self.offset + self.chunk_size);
        let chunk = Chunk {
            offset: self.offset as u64,
            data: &self.data[self.offset..end],
        };
        self.offset = end;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.data.len() - self.offset).div_ceil(self.chunk_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIterator<'_> {}

impl FusedIterator for ChunkIterator<'_> {}
