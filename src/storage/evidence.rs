// src/storage/evidence.rs
//
// Tiered evidence storage. Writes go to the local tier, falling back to the
// remote object store when the local write fails (and optionally
// replicating to it). Every payload carries a SHA-256 of its uncompressed
// bytes, checked on every read regardless of which tier served it.

use super::cache::{ByteCache, CacheStats};
use super::database::{format_ts, parse_ts, to_i64, Database};
use super::local::LocalStore;
use super::object_store::ObjectStore;
use super::with_timeout;
use crate::error::StorageError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Image,
    Video,
    Json,
    Metadata,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Json => "json",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "json" => Some(Self::Json),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
            Self::Json => "json",
            Self::Metadata => "meta",
        }
    }

    pub fn all() -> [DataType; 4] {
        [Self::Image, Self::Video, Self::Json, Self::Metadata]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Local,
    Remote,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub id: String,
    pub violation_id: Option<String>,
    pub tier: StorageTier,
    pub data_type: DataType,
    /// Local file path or remote object key, depending on tier
    pub path: String,
    pub size_bytes: u64,
    pub stored_bytes: u64,
    pub compressed: bool,
    pub checksum: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl StorageMetadata {
    fn remote_key(&self) -> String {
        remote_key(&self.id, self.data_type)
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedEvidence {
    pub data: Vec<u8>,
    pub metadata: StorageMetadata,
    pub from_cache: bool,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn remote_key(id: &str, data_type: DataType) -> String {
    format!("{}/{}.{}", data_type.as_str(), id, data_type.extension())
}

fn row_to_metadata(row: &Row) -> anyhow::Result<StorageMetadata> {
    let tier: String = row.get("tier")?;
    let data_type: String = row.get("data_type")?;
    let tags: String = row.get("tags_json")?;
    let created_at: String = row.get("created_at")?;
    Ok(StorageMetadata {
        id: row.get("id")?,
        violation_id: row.get("violation_id")?,
        tier: StorageTier::parse(&tier).with_context(|| format!("unknown tier '{tier}'"))?,
        data_type: DataType::parse(&data_type)
            .with_context(|| format!("unknown data type '{data_type}'"))?,
        path: row.get("path")?,
        size_bytes: row.get::<_, i64>("size_bytes")?.max(0) as u64,
        stored_bytes: row.get::<_, i64>("stored_bytes")?.max(0) as u64,
        compressed: row.get::<_, i64>("compressed")? != 0,
        checksum: row.get("checksum")?,
        tags: serde_json::from_str(&tags)?,
        created_at: parse_ts(&created_at)?,
    })
}

const METADATA_COLUMNS: &str = "id, violation_id, tier, data_type, path, size_bytes, stored_bytes, compressed, checksum, tags_json, created_at";

pub struct EvidenceStore {
    db: Database,
    local: Option<LocalStore>,
    remote: Option<Arc<dyn ObjectStore>>,
    replicate: bool,
    cache: Mutex<ByteCache>,
    timeout: Duration,
}

impl EvidenceStore {
    pub fn new(
        db: Database,
        local: Option<LocalStore>,
        remote: Option<Arc<dyn ObjectStore>>,
        replicate: bool,
        cache_max_bytes: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            replicate,
            cache: Mutex::new(ByteCache::new(cache_max_bytes)),
            timeout,
        }
    }

    /// Run a blocking tier call off the async runtime, bounded by the
    /// operation timeout.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("storage task failed: {join}"),
            ))),
            Err(_) => Err(StorageError::Timeout),
        }
    }

    pub async fn store(
        &self,
        violation_id: Option<&str>,
        data_type: DataType,
        data: Vec<u8>,
        tags: Vec<String>,
    ) -> Result<StorageMetadata, StorageError> {
        let id = Uuid::new_v4().to_string();
        let checksum = sha256_hex(&data);
        let created_at = Utc::now();
        let data = Arc::new(data);

        let mut placed: Option<(StorageTier, String, u64, bool)> = None;
        if let Some(local) = &self.local {
            let store = local.clone();
            let payload = data.clone();
            let key = id.clone();
            match self
                .blocking(move || store.write(&key, data_type, &created_at, &payload))
                .await
            {
                Ok((path, stored)) => {
                    placed = Some((
                        StorageTier::Local,
                        path.to_string_lossy().into_owned(),
                        stored,
                        local.compresses(),
                    ))
                }
                Err(e) => warn!("Local evidence write failed for {}: {}", id, e),
            }
        }

        if let Some(remote) = &self.remote {
            if placed.is_none() || self.replicate {
                let store = remote.clone();
                let payload = data.clone();
                let key = remote_key(&id, data_type);
                let key_for_task = key.clone();
                match self.blocking(move || store.put(&key_for_task, &payload)).await {
                    Ok(()) => {
                        if placed.is_none() {
                            placed = Some((StorageTier::Remote, key, data.len() as u64, false));
                        }
                    }
                    Err(e) => warn!("Remote evidence write failed for {}: {}", id, e),
                }
            }
        }

        let Some((tier, path, stored_bytes, compressed)) = placed else {
            error!("Evidence {} lost: no storage tier accepted the write", id);
            return Err(StorageError::AllTiersFailed(id));
        };

        let meta = StorageMetadata {
            id: id.clone(),
            violation_id: violation_id.map(str::to_string),
            tier,
            data_type,
            path,
            size_bytes: data.len() as u64,
            stored_bytes,
            compressed,
            checksum,
            tags,
            created_at,
        };

        let row = meta.clone();
        let insert = self.db.execute(move |conn| {
            conn.execute(
                &format!("INSERT INTO evidence ({METADATA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    row.id,
                    row.violation_id,
                    row.tier.as_str(),
                    row.data_type.as_str(),
                    row.path,
                    to_i64(row.size_bytes)?,
                    to_i64(row.stored_bytes)?,
                    row.compressed as i64,
                    row.checksum,
                    serde_json::to_string(&row.tags)?,
                    format_ts(&row.created_at),
                ],
            )
            .context("failed to insert evidence metadata")?;
            Ok(())
        });
        if let Err(e) = with_timeout(self.timeout, insert).await {
            // Bytes are on disk but unreachable through queries
            error!("Evidence metadata for {} lost ({}): {}", id, meta.path, e);
            return Err(e);
        }

        self.cache.lock().put(&id, data.as_ref().clone());
        debug!(
            "Stored {} evidence {} on {} tier ({} → {} bytes)",
            data_type.as_str(),
            id,
            tier.as_str(),
            meta.size_bytes,
            meta.stored_bytes
        );
        Ok(meta)
    }

    pub async fn metadata(&self, id: &str) -> Result<StorageMetadata, StorageError> {
        let key = id.to_string();
        let found = with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {METADATA_COLUMNS} FROM evidence WHERE id = ?1"),
                    params![key],
                    |row| Ok(row_to_metadata(row)),
                )
                .optional()?
                .transpose()
            }),
        )
        .await?;
        found.ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Read and verify. A checksum mismatch is an error, never silently served.
    pub async fn retrieve(&self, id: &str) -> Result<RetrievedEvidence, StorageError> {
        let meta = self.metadata(id).await?;

        if let Some(data) = self.cache.lock().get(id) {
            if sha256_hex(&data) == meta.checksum {
                return Ok(RetrievedEvidence {
                    data,
                    metadata: meta,
                    from_cache: true,
                });
            }
            warn!("Cached evidence {} failed verification, re-reading", id);
        }
        self.cache.lock().remove(id);

        let data = self.read_tiers(&meta).await?;
        let actual = sha256_hex(&data);
        if actual != meta.checksum {
            error!("Evidence {} checksum mismatch", id);
            return Err(StorageError::ChecksumMismatch {
                id: id.to_string(),
                expected: meta.checksum.clone(),
                actual,
            });
        }
        self.cache.lock().put(id, data.clone());
        Ok(RetrievedEvidence {
            data,
            metadata: meta,
            from_cache: false,
        })
    }

    async fn read_tiers(&self, meta: &StorageMetadata) -> Result<Vec<u8>, StorageError> {
        let from_remote = |store: Arc<dyn ObjectStore>, key: String| move || store.get(&key);

        match meta.tier {
            StorageTier::Local => {
                let Some(local) = self.local.clone() else {
                    return Err(StorageError::NotFound(meta.id.clone()));
                };
                let path = PathBuf::from(&meta.path);
                let compressed = meta.compressed;
                match self.blocking(move || local.read(&path, compressed)).await {
                    Ok(data) => Ok(data),
                    Err(e) => match (&self.remote, self.replicate) {
                        (Some(remote), true) => {
                            warn!("Local read of {} failed ({}), trying remote replica", meta.id, e);
                            self.blocking(from_remote(remote.clone(), meta.remote_key())).await
                        }
                        _ => Err(e),
                    },
                }
            }
            StorageTier::Remote => match &self.remote {
                Some(remote) => self.blocking(from_remote(remote.clone(), meta.path.clone())).await,
                None => Err(StorageError::NotFound(meta.id.clone())),
            },
        }
    }

    /// Remove bytes from every tier and drop the row. Returns false if the
    /// id was unknown.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let meta = match self.metadata(id).await {
            Ok(m) => m,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.delete_bytes(&meta).await;

        let key = id.to_string();
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                conn.execute("DELETE FROM evidence WHERE id = ?1", params![key])?;
                Ok(())
            }),
        )
        .await?;
        self.cache.lock().remove(id);
        Ok(true)
    }

    async fn delete_bytes(&self, meta: &StorageMetadata) {
        if meta.tier == StorageTier::Local {
            if let Some(local) = self.local.clone() {
                let path = PathBuf::from(&meta.path);
                if let Err(e) = self.blocking(move || local.delete(&path)).await {
                    warn!("Failed to delete local evidence {}: {}", meta.id, e);
                }
            }
        }
        if let Some(remote) = self.remote.clone() {
            let key = match meta.tier {
                StorageTier::Remote => meta.path.clone(),
                StorageTier::Local => meta.remote_key(),
            };
            if let Err(e) = self.blocking(move || remote.delete(&key)).await {
                warn!("Failed to delete remote evidence {}: {}", meta.id, e);
            }
        }
    }

    pub async fn for_violation(&self, violation_id: &str) -> Result<Vec<StorageMetadata>, StorageError> {
        let key = violation_id.to_string();
        self.query(
            format!("SELECT {METADATA_COLUMNS} FROM evidence WHERE violation_id = ?1 ORDER BY created_at"),
            vec![key],
        )
        .await
    }

    /// Evidence of one type created before `cutoff`.
    pub async fn older_than(
        &self,
        data_type: DataType,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StorageMetadata>, StorageError> {
        self.query(
            format!("SELECT {METADATA_COLUMNS} FROM evidence WHERE data_type = ?1 AND created_at < ?2"),
            vec![data_type.as_str().to_string(), format_ts(&cutoff)],
        )
        .await
    }

    async fn query(&self, sql: String, args: Vec<String>) -> Result<Vec<StorageMetadata>, StorageError> {
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_metadata(row)?);
                }
                Ok(out)
            }),
        )
        .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object_store::DirectoryObjectStore;

    fn store(dir: &std::path::Path, local: bool, remote: bool, replicate: bool) -> EvidenceStore {
        let db = Database::new(dir.join("v.db")).unwrap();
        let local = local.then(|| LocalStore::new(dir.join("local"), true));
        let remote: Option<Arc<dyn ObjectStore>> = remote
            .then(|| Arc::new(DirectoryObjectStore::new(dir.join("remote")).unwrap()) as Arc<dyn ObjectStore>);
        EvidenceStore::new(db, local, remote, replicate, 1024 * 1024, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_image_round_trip_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), true, false, false);
        let image = b"\xff\xd8\xff\xe0 fake jpeg payload".to_vec();
        let meta = s
            .store(Some("v1"), DataType::Image, image.clone(), vec!["speeding".into()])
            .await
            .unwrap();
        assert_eq!(meta.checksum, sha256_hex(&image));
        assert_eq!(meta.tier, StorageTier::Local);

        let got = s.retrieve(&meta.id).await.unwrap();
        assert_eq!(got.data, image);
        assert_eq!(got.metadata.checksum, sha256_hex(&got.data));
        assert!(got.from_cache);
        assert_eq!(s.for_violation("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let s = EvidenceStore::new(
            Database::new(dir.path().join("v.db")).unwrap(),
            Some(LocalStore::new(dir.path().join("local"), false)),
            None,
            false,
            0,
            Duration::from_secs(5),
        );
        let meta = s.store(None, DataType::Image, b"original".to_vec(), vec![]).await.unwrap();
        std::fs::write(&meta.path, b"tampered").unwrap();
        assert!(matches!(
            s.retrieve(&meta.id).await,
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_falls_back_to_remote_tier() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("local");
        // A file where the local root should be makes every local write fail
        std::fs::write(&blocker, b"not a directory").unwrap();
        let s = store(dir.path(), true, true, false);
        let meta = s.store(None, DataType::Video, vec![1, 2, 3], vec![]).await.unwrap();
        assert_eq!(meta.tier, StorageTier::Remote);
        assert_eq!(s.retrieve(&meta.id).await.unwrap().data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_no_tier_available() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), false, false, false);
        assert!(matches!(
            s.store(None, DataType::Image, vec![1], vec![]).await,
            Err(StorageError::AllTiersFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_bytes_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), true, true, true);
        let meta = s.store(None, DataType::Image, vec![9; 32], vec![]).await.unwrap();
        assert!(s.delete(&meta.id).await.unwrap());
        assert!(!std::path::Path::new(&meta.path).exists());
        assert!(matches!(s.retrieve(&meta.id).await, Err(StorageError::NotFound(_))));
        assert!(!s.delete(&meta.id).await.unwrap());
    }
}
