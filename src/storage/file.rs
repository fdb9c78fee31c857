use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use super::backend::PieceStorage;
use super::error::StorageError;
use crate::constants::FILE_HANDLE_IDLE_TIMEOUT;
use crate::torrent::{file_spans, FileEntry, PieceInfo};

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

struct FileHandle {
    file: TokioMutex<File>,
    last_used: parking_lot::Mutex<Instant>,
    writable: bool,
}

struct HandleCache {
    handles: DashMap<usize, Arc<FileHandle>>,
    base_path: PathBuf,
    files: Vec<FileEntry>,
}

impl HandleCache {
    fn path(&self, file_index: usize) -> PathBuf {
        self.base_path.join(&self.files[file_index].path)
    }

    async fn open_read(&self, file_index: usize) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            *handle.last_used.lock() = Instant::now();
            return Ok(handle.clone());
        }

        let path = self.path(file_index);
        let file = File::open(&path)
            .await
            .map_err(|_| StorageError::FileNotFound(path.display().to_string()))?;

        let handle = Arc::new(FileHandle {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            writable: false,
        });
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    async fn open_write(&self, file_index: usize) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.writable {
                *handle.last_used.lock() = Instant::now();
                return Ok(handle.clone());
            }
        }
        // A read-only handle is replaced by a read-write one.
        self.handles.remove(&file_index);

        let path = self.path(file_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let handle = Arc::new(FileHandle {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            writable: true,
        });
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    async fn close_where(&self, predicate: impl Fn(&FileHandle) -> bool) -> Result<(), StorageError> {
        let keys: Vec<usize> = self
            .handles
            .iter()
            .filter(|entry| predicate(entry.value().as_ref()))
            .map(|entry| *entry.key())
            .collect();

        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.writable {
                    handle.file.lock().await.sync_data().await?;
                }
            }
        }
        Ok(())
    }
}

/// Stores a torrent's content in its files under a base directory.
///
/// Pieces may span several files; each block is split along file boundaries.
/// File handles are opened lazily and kept until flushed or idle.
///
/// # Security
///
/// File paths containing `..`, a root or a prefix are rejected, so content can
/// never be written outside the base directory.
pub struct FileStorage {
    files: Vec<FileEntry>,
    handles: HandleCache,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>, files: Vec<FileEntry>) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }

        let base_path = base_path.into();
        Ok(Self {
            handles: HandleCache {
                handles: DashMap::new(),
                base_path,
                files: files.clone(),
            },
            files,
        })
    }

    /// Creates every file at its final length.
    pub async fn preallocate(&self) -> Result<(), StorageError> {
        for (index, file) in self.files.iter().enumerate() {
            let handle = self.handles.open_write(index).await?;
            handle.file.lock().await.set_len(file.length).await?;
        }
        Ok(())
    }

    /// Closes handles unused for longer than `idle_for`, syncing writable
    /// ones first.
    pub async fn evict_idle_handles(&self, idle_for: Duration) -> Result<(), StorageError> {
        let now = Instant::now();
        self.handles
            .close_where(|h| now.duration_since(*h.last_used.lock()) >= idle_for)
            .await
    }

    #[cfg(test)]
    pub(crate) fn open_handles(&self) -> usize {
        self.handles.handles.len()
    }
}

#[async_trait]
impl PieceStorage for FileStorage {
    async fn read(&self, piece: &PieceInfo, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let spans = file_spans(&self.files, piece.offset + offset as u64, length as u64);
        let mut data = Vec::with_capacity(length as usize);

        for span in spans {
            let handle = self.handles.open_read(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let start = data.len();
            data.resize(start + span.length as usize, 0);
            file.read_exact(&mut data[start..]).await?;
        }

        if data.len() != length as usize {
            return Err(StorageError::InvalidBlockOffset {
                piece: piece.index,
                offset,
                length,
            });
        }
        Ok(Bytes::from(data))
    }

    async fn write(&self, piece: &PieceInfo, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let spans = file_spans(&self.files, piece.offset + offset as u64, data.len() as u64);
        let mut written = 0usize;

        for span in spans {
            let handle = self.handles.open_write(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[written..written + span.length as usize];
            file.write_all(chunk).await?;
            written += chunk.len();
        }

        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.handles.close_where(|_| true).await
    }

    async fn release_idle(&self) -> Result<(), StorageError> {
        self.evict_idle_handles(FILE_HANDLE_IDLE_TIMEOUT).await
    }
}
