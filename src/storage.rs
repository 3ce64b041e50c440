//! Disk persistence for chain state, scan cursor, and watch list.
//!
//! Blocking file I/O runs on the blocking pool. Writes go through a temp file
//! followed by a rename, so a crash mid-write leaves the previous snapshot
//! intact rather than a truncated one.

use std::path::PathBuf;

use crate::error::{StorageError, StorageResult};

const HEADERS_FILE: &str = "headers.dat";
const CURSOR_FILE: &str = "cursor.dat";
const WATCH_LIST_FILE: &str = "watchlist.json";

/// File-backed store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct ChainStore {
    base: PathBuf,
}

impl ChainStore {
    /// Open a store at `base`, creating the directory if needed.
    pub async fn open(base: impl Into<PathBuf>) -> StorageResult<Self> {
        let base = base.into();
        let dir = base.clone();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(&dir))
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Blocking task failed: {}", e)))??;
        Ok(Self {
            base,
        })
    }

    pub async fn save_headers(&self, bytes: Vec<u8>) -> StorageResult<()> {
        self.write_file(HEADERS_FILE, bytes).await
    }

    pub async fn load_headers(&self) -> StorageResult<Option<Vec<u8>>> {
        self.read_file(HEADERS_FILE).await
    }

    pub async fn save_cursor(&self, bytes: Vec<u8>) -> StorageResult<()> {
        self.write_file(CURSOR_FILE, bytes).await
    }

    pub async fn load_cursor(&self) -> StorageResult<Option<Vec<u8>>> {
        self.read_file(CURSOR_FILE).await
    }

    pub async fn save_watch_list(&self, bytes: Vec<u8>) -> StorageResult<()> {
        self.write_file(WATCH_LIST_FILE, bytes).await
    }

    pub async fn load_watch_list(&self) -> StorageResult<Option<Vec<u8>>> {
        self.read_file(WATCH_LIST_FILE).await
    }

    async fn write_file(&self, name: &str, bytes: Vec<u8>) -> StorageResult<()> {
        let path = self.base.join(name);
        let tmp = self.base.join(format!("{}.tmp", name));
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::WriteFailed(format!("Blocking task failed: {}", e)))?
    }

    async fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.base.join(name);
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        })
        .await
        .map_err(|e| StorageError::ReadFailed(format!("Blocking task failed: {}", e)))?
    }
}
