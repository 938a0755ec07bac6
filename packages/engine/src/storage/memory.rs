use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    effective_chunk_size, ReadStreamOptions, StorageBackend, StorageChunkReader,
    StorageChunkWriter, StorageStat,
};
use crate::ParqueError;

/// In-memory backend for tests and ephemeral databases. The single map
/// mutex serializes appends per path (and across paths, which is stricter
/// than the contract requires).
#[derive(Default)]
pub struct MemoryBackend {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_files<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> T) -> T {
        let mut files = self.files.lock().unwrap();
        f(&mut files)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn exists(&self, path: &str) -> Result<bool, ParqueError> {
        Ok(self.with_files(|files| files.contains_key(path)))
    }

    async fn stat(&self, path: &str) -> Result<StorageStat, ParqueError> {
        self.with_files(|files| {
            files
                .get(path)
                .map(|bytes| StorageStat {
                    size: bytes.len() as u64,
                    modified_at: Some(Utc::now()),
                })
                .ok_or_else(|| ParqueError::not_found(path))
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, ParqueError> {
        self.with_files(|files| {
            files
                .get(path)
                .cloned()
                .ok_or_else(|| ParqueError::not_found(path))
        })
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, ParqueError> {
        self.with_files(|files| {
            let bytes = files.get(path).ok_or_else(|| ParqueError::not_found(path))?;
            let start = (offset as usize).min(bytes.len());
            let end = (offset.saturating_add(len) as usize).min(bytes.len());
            Ok(bytes[start..end].to_vec())
        })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError> {
        self.with_files(|files| {
            files.insert(path.to_string(), bytes.to_vec());
        });
        Ok(())
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError> {
        self.with_files(|files| {
            files
                .entry(path.to_string())
                .or_default()
                .extend_from_slice(bytes);
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, ParqueError> {
        Ok(self.with_files(|files| files.remove(path).is_some()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ParqueError> {
        Ok(self.with_files(|files| {
            files
                .keys()
                .filter(|path| path.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), ParqueError> {
        self.with_files(|files| {
            let bytes = files
                .get(from)
                .cloned()
                .ok_or_else(|| ParqueError::not_found(from))?;
            files.insert(to.to_string(), bytes);
            Ok(())
        })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ParqueError> {
        self.with_files(|files| {
            let bytes = files
                .remove(from)
                .ok_or_else(|| ParqueError::not_found(from))?;
            files.insert(to.to_string(), bytes);
            Ok(())
        })
    }

    async fn read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<Box<dyn StorageChunkReader>, ParqueError> {
        let bytes = self.read(path).await?;
        let start = options.start.unwrap_or(0) as usize;
        let end = options
            .end
            .map(|end| (end as usize + 1).min(bytes.len()))
            .unwrap_or(bytes.len());
        let window = if start < end {
            bytes[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(Box::new(MemoryChunkReader {
            bytes: window,
            cursor: 0,
            chunk_size: effective_chunk_size(options.chunk_size),
        }))
    }

    async fn write_stream(&self, path: &str) -> Result<Box<dyn StorageChunkWriter>, ParqueError> {
        Ok(Box::new(MemoryChunkWriter {
            files: Arc::clone(&self.files),
            path: path.to_string(),
            buffer: Vec::new(),
            finished: false,
        }))
    }
}

struct MemoryChunkReader {
    bytes: Vec<u8>,
    cursor: usize,
    chunk_size: usize,
}

#[async_trait]
impl StorageChunkReader for MemoryChunkReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ParqueError> {
        if self.cursor >= self.bytes.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.chunk_size).min(self.bytes.len());
        let chunk = self.bytes[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(chunk))
    }
}

struct MemoryChunkWriter {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    path: String,
    buffer: Vec<u8>,
    finished: bool,
}

#[async_trait]
impl StorageChunkWriter for MemoryChunkWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ParqueError> {
        if self.finished {
            return Err(ParqueError::invariant("write after finish"));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ParqueError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut files = self.files.lock().unwrap();
        files.insert(self.path.clone(), std::mem::take(&mut self.buffer));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryBackend;
    use crate::storage::{ReadStreamOptions, StorageBackend};

    #[tokio::test]
    async fn read_of_missing_path_is_not_found() {
        let backend = MemoryBackend::new();
        let error = backend.read("missing").await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn delete_of_missing_path_returns_false() {
        let backend = MemoryBackend::new();
        assert!(!backend.delete("missing").await.unwrap());
        backend.write("present", b"x").await.unwrap();
        assert!(backend.delete("present").await.unwrap());
    }

    #[tokio::test]
    async fn ranged_reads_clamp_to_file_length() {
        let backend = MemoryBackend::new();
        backend.write("f", b"0123456789").await.unwrap();
        assert_eq!(backend.read_range("f", 2, 3).await.unwrap(), b"234");
        assert_eq!(backend.read_range("f", 8, 10).await.unwrap(), b"89");
        assert_eq!(backend.read_range("f", 20, 1).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn list_returns_prefix_matches_sorted() {
        let backend = MemoryBackend::new();
        backend.write("data/posts/a", b"1").await.unwrap();
        backend.write("data/users/b", b"2").await.unwrap();
        backend.write("data/posts/c", b"3").await.unwrap();
        assert_eq!(
            backend.list("data/posts/").await.unwrap(),
            vec!["data/posts/a".to_string(), "data/posts/c".to_string()]
        );
    }

    #[tokio::test]
    async fn write_stream_commits_only_on_finish() {
        let backend = MemoryBackend::new();
        let mut writer = backend.write_stream("streamed").await.unwrap();
        writer.write_chunk(b"hello ").await.unwrap();
        writer.write_chunk(b"world").await.unwrap();
        assert!(!backend.exists("streamed").await.unwrap());
        writer.finish().await.unwrap();
        assert_eq!(backend.read("streamed").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn read_stream_honors_start_and_end() {
        let backend = MemoryBackend::new();
        backend.write("f", b"abcdef").await.unwrap();
        let mut reader = backend
            .read_stream(
                "f",
                ReadStreamOptions {
                    start: Some(1),
                    end: Some(3),
                    chunk_size: 2,
                },
            )
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"bcd");
    }
}
