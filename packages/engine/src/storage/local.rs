use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    effective_chunk_size, ReadStreamOptions, StorageBackend, StorageChunkReader,
    StorageChunkWriter, StorageStat,
};
use crate::ParqueError;

/// Filesystem backend rooted at a directory. Writes go through a temp
/// file and an atomic rename; appends are serialized per path by a lock
/// table.
pub struct LocalBackend {
    root: PathBuf,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ParqueError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            append_locks: Mutex::new(HashMap::new()),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ParqueError> {
        if path.split('/').any(|segment| segment == "..") {
            return Err(ParqueError::invariant(format!(
                "storage path escapes root: {path}"
            )));
        }
        Ok(self.root.join(path))
    }

    fn append_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().unwrap();
        Arc::clone(locks.entry(path.to_string()).or_default())
    }

    fn temp_path(&self, target: &Path) -> PathBuf {
        let name = format!(
            ".{}.tmp-{}",
            target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string()),
            uuid::Uuid::now_v7()
        );
        target.with_file_name(name)
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), ParqueError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path(target);
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, target)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result.map_err(ParqueError::from)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn exists(&self, path: &str) -> Result<bool, ParqueError> {
        Ok(self.resolve(path)?.is_file())
    }

    async fn stat(&self, path: &str) -> Result<StorageStat, ParqueError> {
        let metadata = fs::metadata(self.resolve(path)?)?;
        let modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(StorageStat {
            size: metadata.len(),
            modified_at,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, ParqueError> {
        Ok(fs::read(self.resolve(path)?)?)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, ParqueError> {
        let mut file = fs::File::open(self.resolve(path)?)?;
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(offset))?;
        let available = (size - offset).min(len) as usize;
        let mut buffer = vec![0u8; available];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError> {
        self.write_atomic(&self.resolve(path)?, bytes)
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<(), ParqueError> {
        let lock = self.append_lock(path);
        let target = self.resolve(path)?;
        let _guard = lock.lock().unwrap();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&target)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, ParqueError> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ParqueError> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let name = relative
                        .components()
                        .map(|component| component.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if name.starts_with(prefix)
                        && !Path::new(&name)
                            .file_name()
                            .is_some_and(|file| file.to_string_lossy().starts_with('.'))
                    {
                        results.push(name);
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), ParqueError> {
        let bytes = self.read(from).await?;
        self.write(to, &bytes).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ParqueError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, target)?;
        Ok(())
    }

    async fn read_stream(
        &self,
        path: &str,
        options: ReadStreamOptions,
    ) -> Result<Box<dyn StorageChunkReader>, ParqueError> {
        let mut file = fs::File::open(self.resolve(path)?)?;
        let size = file.metadata()?.len();
        let start = options.start.unwrap_or(0).min(size);
        let end = options
            .end
            .map(|end| (end + 1).min(size))
            .unwrap_or(size);
        file.seek(SeekFrom::Start(start))?;
        Ok(Box::new(LocalChunkReader {
            file,
            remaining: end.saturating_sub(start),
            chunk_size: effective_chunk_size(options.chunk_size),
        }))
    }

    async fn write_stream(&self, path: &str) -> Result<Box<dyn StorageChunkWriter>, ParqueError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = self.temp_path(&target);
        let file = fs::File::create(&temp)?;
        Ok(Box::new(LocalChunkWriter {
            file: Some(file),
            temp,
            target,
        }))
    }
}

struct LocalChunkReader {
    file: fs::File,
    remaining: u64,
    chunk_size: usize,
}

#[async_trait]
impl StorageChunkReader for LocalChunkReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ParqueError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let take = (self.chunk_size as u64).min(self.remaining) as usize;
        let mut buffer = vec![0u8; take];
        let read = self.file.read(&mut buffer)?;
        if read == 0 {
            self.remaining = 0;
            return Ok(None);
        }
        buffer.truncate(read);
        self.remaining -= read as u64;
        Ok(Some(buffer))
    }
}

struct LocalChunkWriter {
    file: Option<fs::File>,
    temp: PathBuf,
    target: PathBuf,
}

#[async_trait]
impl StorageChunkWriter for LocalChunkWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ParqueError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ParqueError::invariant("write after finish"))?;
        file.write_all(chunk)?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ParqueError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp, &self.target)?;
        Ok(())
    }
}

impl Drop for LocalChunkWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp);
        }
    }
}
