/*!
Local filesystem storage adapter implementation.
*/

use super::StorageAdapter;
use crate::{Result, VaultError};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Local filesystem storage adapter
///
/// Every key resolves to a file below the base directory. Writes go to a
/// temporary file in the destination directory which is then renamed over
/// the final path, so readers never observe a partially written blob.
///
/// # Example
/// ```rust
/// use fwvault_core::storage::{LocalFileStorage, StorageAdapter};
///
/// let dir = tempfile::tempdir().unwrap();
/// let storage = LocalFileStorage::with_base_dir(dir.path());
/// storage.save(b"config system global\nend\n", "fw-01/objects/abc.cfg").unwrap();
/// assert!(storage.exists("fw-01/objects/abc.cfg"));
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key below the base directory, refusing escapes
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(VaultError::storage(format!("Invalid storage key: {key}")));
        }
        Ok(self.base_dir.join(relative))
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                VaultError::storage(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(VaultError::storage(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                // Skip in-progress temporary files
                let is_temp = relative
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(".tmp"));
                if !is_temp {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        Ok(())
    }
}

impl StorageAdapter for LocalFileStorage {
    fn save(&self, data: &[u8], key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;
        let parent = full_path
            .parent()
            .ok_or_else(|| VaultError::storage(format!("Key has no parent directory: {key}")))?;
        self.ensure_dir(parent)?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| {
            VaultError::storage(format!(
                "Failed to create temporary file in {}: {}",
                parent.display(),
                e
            ))
        })?;
        temp.write_all(data)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| {
                VaultError::storage(format!("Failed to write {}: {}", full_path.display(), e))
            })?;
        temp.persist(&full_path).map_err(|e| {
            VaultError::storage(format!(
                "Failed to publish {}: {}",
                full_path.display(),
                e.error
            ))
        })?;

        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(key)?;

        fs::read(&full_path).map_err(|e| {
            VaultError::storage(format!("Failed to read {}: {}", full_path.display(), e))
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve_path(key).map_or(false, |p| p.is_file())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;

        if full_path.exists() {
            fs::remove_file(&full_path).map_err(|e| {
                VaultError::storage(format!("Failed to delete {}: {}", full_path.display(), e))
            })?;
        }

        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk only the directory the prefix names
        let start = match prefix.rfind('/') {
            Some(idx) => self.resolve_path(&prefix[..idx])?,
            None => self.base_dir.clone(),
        };
        let mut keys = Vec::new();
        self.collect_keys(&start, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
