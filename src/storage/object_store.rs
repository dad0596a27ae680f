// src/storage/object_store.rs
//
// Durable remote tier. Cloud backends implement `ObjectStore`; the
// directory-backed store stands in for a mounted bucket or NFS share.
// Calls are blocking and are run through spawn_blocking by the caller.

use crate::error::StorageError;
use std::fs;
use std::path::PathBuf;

pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn exists(&self, key: &str) -> bool;
}

pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Keys may contain '/', but never escape the root.
    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn name(&self) -> &str {
        "directory"
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => e.into(),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.path(key).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryObjectStore::new(dir.path()).unwrap();
        store.put("image/abc.jpg", b"jpeg").unwrap();
        assert!(store.exists("image/abc.jpg"));
        assert_eq!(store.get("image/abc.jpg").unwrap(), b"jpeg");
        store.delete("image/abc.jpg").unwrap();
        assert!(matches!(store.get("image/abc.jpg"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryObjectStore::new(dir.path()).unwrap();
        assert!(store.put("../outside", b"x").is_err());
        assert!(!store.exists("a//b"));
    }
}
