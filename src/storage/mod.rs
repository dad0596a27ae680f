// src/storage/mod.rs
//
// Violation Manager, tiered evidence storage and retention.

pub mod cache;
pub mod database;
pub mod evidence;
pub mod local;
pub mod migrations;
pub mod object_store;
pub mod retention;
pub mod violation_manager;

pub use cache::{ByteCache, CacheStats};
pub use database::Database;
pub use evidence::{sha256_hex, DataType, EvidenceStore, RetrievedEvidence, StorageMetadata, StorageTier};
pub use local::LocalStore;
pub use object_store::{DirectoryObjectStore, ObjectStore};
pub use retention::{RetentionConfig, RetentionPolicy, RetentionReport};
pub use violation_manager::{
    LocationCount, OffenderCount, ViolationManager, ViolationQuery, ViolationReport,
    ViolationStatistics,
};

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub local_root: PathBuf,
    /// Disable to keep only the remote tier
    pub local_enabled: bool,
    pub compress_local: bool,
    /// Directory standing in for the remote object store; None disables the tier
    pub remote_root: Option<PathBuf>,
    /// Also copy every local write to the remote tier
    pub replicate_to_remote: bool,
    pub cache_max_bytes: usize,
    /// Upper bound on any single storage call
    pub operation_timeout_ms: u64,
    pub retention: RetentionConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/violations.db"),
            local_root: PathBuf::from("data/evidence"),
            local_enabled: true,
            compress_local: true,
            remote_root: None,
            replicate_to_remote: false,
            cache_max_bytes: 64 * 1024 * 1024,
            operation_timeout_ms: 5_000,
            retention: RetentionConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }
}

/// Bound a database call; timeouts and worker errors become StorageError.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, StorageError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StorageError::from),
        Err(_) => Err(StorageError::Timeout),
    }
}

/// Open the database and both tiers described by the config.
pub fn open(config: &StorageConfig) -> anyhow::Result<(Arc<ViolationManager>, Arc<EvidenceStore>)> {
    let db = Database::new(config.database_path.clone())?;
    let local = config
        .local_enabled
        .then(|| LocalStore::new(config.local_root.clone(), config.compress_local));
    let remote: Option<Arc<dyn ObjectStore>> = match &config.remote_root {
        Some(root) => Some(Arc::new(DirectoryObjectStore::new(root.clone())?)),
        None => None,
    };
    info!(
        "Storage: local={} (compress={}), remote={}, cache={} MiB",
        config.local_enabled,
        config.compress_local,
        remote.as_ref().map_or("none", |r| r.name()),
        config.cache_max_bytes / (1024 * 1024)
    );
    let evidence = Arc::new(EvidenceStore::new(
        db.clone(),
        local,
        remote,
        config.replicate_to_remote,
        config.cache_max_bytes,
        config.timeout(),
    ));
    let manager = Arc::new(ViolationManager::new(db, evidence.clone(), config.timeout()));
    Ok((manager, evidence))
}
