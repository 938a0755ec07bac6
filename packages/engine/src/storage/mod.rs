mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ParqueError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStat {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStreamOptions {
    pub start: Option<u64>,
    /// Inclusive end offset; None reads to the end of the file.
    pub end: Option<u64>,
    /// Target chunk size; 0 picks the backend default.
    pub chunk_size: usize,
}

#[async_trait]
pub trait StorageChunkReader: Send {
    /// Returns the next chunk, or None at end of stream.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ParqueError>;
}

#[async_trait]
pub trait StorageChunkWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ParqueError>;

    /// Commits the stream. Until `finish` returns, readers must not observe
    /// a partially written file.
    async fn finish(&mut self) -> Result<(), ParqueError> {
        Ok(())
    }
}

/// Blob-style byte store with ranged reads and streaming.
///
/// Guarantees implementations must uphold:
/// - `write` is atomic: concurrent readers see the old bytes or the new
///   bytes, never a torn file.
/// - `append` is serialized per path: concurrent appenders lose no bytes
///   and never interleave within one append.
/// - `delete` of a missing path returns `Ok(false)`.
/// - `read` of a missing path fails with `NotFound`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, ParqueError>;

    async fn stat(&self, path: &str) -> Result<StorageStat, ParqueError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, ParqueError>;

    /// Ranged read. Short reads at end-of-file return the available bytes.
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, ParqueError>;

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError>;

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError>;

    async fn delete(&self, path: &str) -> Result<bool, ParqueError>;

    /// Complete listing of every path with the given prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ParqueError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), ParqueError>;

    /// Atomic rename; the destination is replaced if present.
    async fn rename(&self, from: &str, to: &str) -> Result<(), ParqueError>;

    async fn read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<Box<dyn StorageChunkReader>, ParqueError>;

    async fn write_stream(&self, path: &str) -> Result<Box<dyn StorageChunkWriter>, ParqueError>;
}

pub(crate) const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) fn effective_chunk_size(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        requested
    }
}
