// src/storage/local.rs
//
// Fast local tier: plain files under a root directory, gzip-compressed
// when enabled. Layout: <root>/<data_type>/<YYYY>/<MM>/<DD>/<id>.<ext>[.gz]

use super::evidence::DataType;
use crate::error::StorageError;
use chrono::{DateTime, Datelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    compress: bool,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            root: root.into(),
            compress,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    fn path_for(&self, id: &str, data_type: DataType, at: &DateTime<Utc>) -> PathBuf {
        let mut name = format!("{}.{}", id, data_type.extension());
        if self.compress {
            name.push_str(".gz");
        }
        self.root
            .join(data_type.as_str())
            .join(format!("{:04}", at.year()))
            .join(format!("{:02}", at.month()))
            .join(format!("{:02}", at.day()))
            .join(name)
    }

    /// Write a payload; returns the file path and the bytes on disk.
    pub fn write(
        &self,
        id: &str,
        data_type: DataType,
        at: &DateTime<Utc>,
        data: &[u8],
    ) -> Result<(PathBuf, u64), StorageError> {
        let path = self.path_for(id, data_type, at);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = if self.compress {
            let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
            enc.write_all(data)?;
            enc.finish()?
        } else {
            data.to_vec()
        };
        // Write-then-rename so a crash never leaves a truncated file behind
        let tmp = path.with_extension("partial");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        Ok((path, bytes.len() as u64))
    }

    pub fn read(&self, path: &Path, compressed: bool) -> Result<Vec<u8>, StorageError> {
        let raw = fs::read(path)?;
        if !compressed {
            return Ok(raw);
        }
        let mut out = Vec::with_capacity(raw.len() * 2);
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn delete(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), true);
        let data = vec![7u8; 10_000];
        let (path, stored) = store
            .write("e1", DataType::Image, &Utc::now(), &data)
            .unwrap();
        assert!(path.to_string_lossy().ends_with(".jpg.gz"));
        assert!(stored < data.len() as u64, "repetitive data compresses");
        assert_eq!(store.read(&path, true).unwrap(), data);
    }

    #[test]
    fn test_plain_write_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), false);
        let (path, stored) = store
            .write("m1", DataType::Json, &Utc::now(), b"{}")
            .unwrap();
        assert_eq!(stored, 2);
        assert!(path.starts_with(dir.path().join("json")));
        store.delete(&path).unwrap();
        assert!(!path.exists());
        store.delete(&path).unwrap();
    }
}
