/*!
Storage adapters for configuration blobs and snapshot indexes.

The artifact store only talks to this port; the backing medium is opaque
to it. Keys are `/`-separated relative paths such as
`fw-01/objects/<hash>.cfg.gz` or `fw-01/index.json`.
*/

pub mod local;

use crate::{Result, VaultError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub use local::LocalFileStorage;

/// Storage abstraction for saving and loading opaque bytes by key
///
/// `save` must be atomic: a reader sees either the previous value or the
/// complete new one, never a partial write.
pub trait StorageAdapter: Send + Sync {
    fn save(&self, data: &[u8], key: &str) -> Result<()>;

    fn load(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> bool;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

impl<T: StorageAdapter + ?Sized> StorageAdapter for Arc<T> {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        (**self).save(data, key)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        (**self).load(key)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }
}

impl<T: StorageAdapter + ?Sized> StorageAdapter for Box<T> {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        (**self).save(data, key)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        (**self).load(key)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }
}

/// In-memory storage adapter
///
/// Used by tests and by embedders that keep snapshots only for the life of
/// the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageAdapter for MemoryStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        self.entries().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        self.entries()
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::storage(format!("Key not found: {key}")))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic_operations() {
        let storage = MemoryStorage::new();
        storage.save(b"blob", "fw-01/objects/abc.cfg").unwrap();

        assert!(storage.exists("fw-01/objects/abc.cfg"));
        assert_eq!(storage.load("fw-01/objects/abc.cfg").unwrap(), b"blob");

        storage.delete("fw-01/objects/abc.cfg").unwrap();
        assert!(!storage.exists("fw-01/objects/abc.cfg"));
        assert!(storage.delete("fw-01/objects/abc.cfg").is_ok());
        assert!(storage.load("fw-01/objects/abc.cfg").is_err());
    }

    #[test]
    fn test_memory_storage_list_by_prefix() {
        let storage = MemoryStorage::new();
        storage.save(b"1", "fw-01/index.json").unwrap();
        storage.save(b"2", "fw-01/objects/a.cfg").unwrap();
        storage.save(b"3", "fw-02/index.json").unwrap();
        storage.save(b"4", "fw-010/index.json").unwrap();

        assert_eq!(
            storage.list("fw-01/").unwrap(),
            vec!["fw-01/index.json", "fw-01/objects/a.cfg"]
        );
        assert_eq!(storage.list("").unwrap().len(), 4);
        assert!(storage.list("fw-99/").unwrap().is_empty());
    }

    #[test]
    fn test_shared_handles_see_same_data() {
        let storage = Arc::new(MemoryStorage::new());
        let other = Arc::clone(&storage);
        storage.save(b"x", "k").unwrap();
        assert!(other.exists("k"));
    }
}
