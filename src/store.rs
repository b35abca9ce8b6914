//! Block Store Adapter: the only I/O boundary a session touches per block.
//!
//! Sessions only ever ask for sequential, monotonically increasing offsets.
//! Trait methods block on disk I/O, so async code reaches the store through
//! [`blocking`], which runs them on tokio's blocking pool.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransferError};

pub trait BlockStore: Send + Sync {
    /// Up to `max_len` bytes starting at `offset`. Fewer bytes, or none, at
    /// or past the end of the file.
    fn read_chunk(&self, name: &str, offset: u64, max_len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`. Offset 0 starts the file afresh; later
    /// calls extend it.
    fn append_chunk(&self, name: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Remove a partially written file. A missing file is not an error.
    fn discard(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> bool;
}

/// Run `op` against `store` off the reactor, so one session's disk I/O
/// never holds up datagrams for the others.
pub async fn blocking<T, F>(store: &Arc<dyn BlockStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn BlockStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(io::Error::from)?
}

/// Files kept under a single directory.
#[derive(Debug, Clone)]
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> FsBlockStore {
        FsBlockStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it is absent.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Map a requested name onto a path inside the root. Only the final
    /// path component is kept, so a peer cannot escape the directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .last()
            .ok_or_else(|| TransferError::InvalidFilename(name.to_string()))?;
        Ok(self.root.join(file_name))
    }
}

impl BlockStore for FsBlockStore {
    fn read_chunk(&self, name: &str, offset: u64, max_len: usize) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::NotFound(name.to_string()),
            _ => TransferError::Io(e),
        })?;
        if !file.metadata()?.is_file() {
            return Err(TransferError::NotFound(name.to_string()));
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = Vec::with_capacity(max_len);
        file.take(max_len as u64).read_to_end(&mut chunk)?;
        Ok(chunk)
    }

    fn append_chunk(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        self.ensure_root()?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn discard(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }
}

/// In-memory store, handy for tests and for embedding the protocol engine
/// without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> MemoryBlockStore {
        MemoryBlockStore::default()
    }

    pub fn insert(&self, name: &str, contents: Vec<u8>) {
        self.lock().insert(name.to_string(), contents);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned map still holds consistent byte vectors.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_chunk(&self, name: &str, offset: u64, max_len: usize) -> Result<Vec<u8>> {
        let files = self.lock();
        let contents = files
            .get(name)
            .ok_or_else(|| TransferError::NotFound(name.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(contents.len());
        let end = start.saturating_add(max_len).min(contents.len());
        Ok(contents[start..end].to_vec())
    }

    fn append_chunk(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(TransferError::InvalidFilename(name.to_string()));
        }
        let mut files = self.lock();
        let contents = files.entry(name.to_string()).or_default();
        let offset = usize::try_from(offset).map_err(|_| TransferError::FileTooLarge)?;
        contents.truncate(offset);
        contents.resize(offset, 0);
        contents.extend_from_slice(data);
        Ok(())
    }

    fn discard(&self, name: &str) -> Result<()> {
        self.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }
}
