//! Key-value storage for content-addressed chunks.
//!
//! Keys are lowercase hex SHA-256 digests of their values, so every writer of a
//! key writes the same bytes and racing writers are harmless.

use std::{
    collections::HashMap,
    fmt::Debug,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Storage collaborator used by the engine to hold chunks.
pub trait Storage: Debug + Send + Sync {
    fn has(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<Bytes>;

    fn set(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// List every key currently held, in no particular order.
    fn keys(&self) -> Vec<String>;

    /// Remove a key, no-op if absent.
    fn clear(&self, key: &str);
}

#[derive(Debug, Default)]
/// In-memory [Storage], lost when the process exits.
pub struct MemoryStorage {
    chunks: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn has(&self, key: &str) -> bool {
        self.chunks
            .read()
            .map(|chunks| chunks.contains_key(key))
            .unwrap_or(false)
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.chunks.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        debug!(?key, size = value.len(), "Storing chunk");

        self.chunks
            .write()
            .map_err(|_| StorageError::Poisoned)?
            .insert(key.to_string(), value);

        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.chunks
            .read()
            .map(|chunks| chunks.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn clear(&self, key: &str) {
        if let Ok(mut chunks) = self.chunks.write() {
            chunks.remove(key);
        }
    }
}

#[derive(Debug, Clone)]
/// [Storage] keeping one file per key under a root directory.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if missing) a storage root directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, io::Error> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        is_valid_key(key).then(|| self.root.join(key))
    }
}

impl Storage for FileStorage {
    fn has(&self, key: &str) -> bool {
        self.path(key).is_some_and(|path| path.is_file())
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.path(key)?;

        match fs::read(&path) {
            Ok(data) => Some(data.into()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(?key, ?error, "Failed to read chunk");
                None
            }
        }
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        let path = self
            .path(key)
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;

        debug!(?key, size = value.len(), root = ?self.root, "Storing chunk");

        // Each writer gets its own temporary file, renamed into place once complete.
        let mut partial = NamedTempFile::new_in(&self.root)?;
        partial.write_all(&value)?;
        partial.persist(&path).map_err(|error| error.error)?;

        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(root = ?self.root, ?error, "Failed to list storage root");
                return vec![];
            }
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_valid_key(name))
            .collect()
    }

    fn clear(&self, key: &str) {
        if let Some(path) = self.path(key) {
            if let Err(error) = fs::remove_file(path) {
                if error.kind() != io::ErrorKind::NotFound {
                    warn!(?key, ?error, "Failed to remove chunk");
                }
            }
        }
    }
}

/// Keys double as file names, so only non-empty lowercase hex is accepted.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(thiserror::Error, Debug)]
/// Storage errors
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    const DF_KEY: &str = "2ea970ff63aec5d7a014ca6447ec743d3ba37450b85ebdcbb582b089b0194fa2";

    fn single_byte_chunk(storage: &dyn Storage) {
        storage.set(DF_KEY, Bytes::from_static(&[0xdf])).unwrap();

        assert!(storage.has(DF_KEY));
        assert_eq!(storage.get(DF_KEY), Some(Bytes::from_static(&[0xdf])));
        assert_eq!(storage.get("deadbeef"), None);
        assert!(!storage.has("deadbeef"));
        assert_eq!(storage.keys(), vec![DF_KEY.to_string()]);

        storage.clear(DF_KEY);
        assert!(!storage.has(DF_KEY));
        assert!(storage.keys().is_empty());

        // Clearing an absent key is a no-op.
        storage.clear(DF_KEY);
    }

    #[test]
    fn memory_storage() {
        single_byte_chunk(&MemoryStorage::new());
    }

    #[test]
    fn file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("chunks")).unwrap();

        single_byte_chunk(&storage);
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        FileStorage::open(dir.path())
            .unwrap()
            .set(DF_KEY, Bytes::from_static(&[0xdf]))
            .unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.get(DF_KEY), Some(Bytes::from_static(&[0xdf])));
    }

    #[test]
    fn file_storage_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).unwrap());

        let value = Bytes::from(vec![0xdf; 1 << 20]);
        let key = crate::Id::hash(&value).to_hex();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = storage.clone();
                let value = value.clone();
                let key = key.clone();

                std::thread::spawn(move || {
                    for _ in 0..30 {
                        storage.set(&key, value.clone()).unwrap();
                        assert_eq!(storage.get(&key).map(|data| data.len()), Some(value.len()));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.keys(), vec![key]);
    }

    #[test]
    fn file_storage_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        assert!(matches!(
            storage.set("../escape", Bytes::from_static(b"x")),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(!storage.has("../escape"));
        assert_eq!(storage.get(""), None);
    }
}
