// src/storage/retention.rs
//
// Per-data-type retention. Violation rows past their window are written to
// an audit snapshot before deletion when auditing is on.

use super::evidence::{DataType, EvidenceStore};
use super::violation_manager::ViolationManager;
use crate::error::StorageError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub image_days: u32,
    pub video_days: u32,
    pub json_days: u32,
    pub metadata_days: u32,
    pub violation_days: u32,
    /// Snapshot expiring violation rows before deleting them
    pub audit_snapshot: bool,
    pub audit_dir: PathBuf,
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_days: 90,
            video_days: 30,
            json_days: 365,
            metadata_days: 365,
            violation_days: 365,
            audit_snapshot: true,
            audit_dir: PathBuf::from("data/audit"),
            interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn days_for(&self, data_type: DataType) -> u32 {
        match data_type {
            DataType::Image => self.image_days,
            DataType::Video => self.video_days,
            DataType::Json => self.json_days,
            DataType::Metadata => self.metadata_days,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub evidence_deleted: BTreeMap<String, usize>,
    pub evidence_failed: usize,
    pub violations_deleted: usize,
    pub audit_file: Option<PathBuf>,
}

impl RetentionReport {
    pub fn total_evidence_deleted(&self) -> usize {
        self.evidence_deleted.values().sum()
    }
}

pub struct RetentionPolicy {
    config: RetentionConfig,
    manager: Arc<ViolationManager>,
    evidence: Arc<EvidenceStore>,
}

impl RetentionPolicy {
    pub fn new(config: RetentionConfig, manager: Arc<ViolationManager>, evidence: Arc<EvidenceStore>) -> Self {
        Self {
            config,
            manager,
            evidence,
        }
    }

    /// One sweep as of `now`. Failures on single evidence items are counted
    /// and the sweep continues.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport, StorageError> {
        let mut report = RetentionReport::default();

        for data_type in DataType::all() {
            let cutoff = now - ChronoDuration::days(self.config.days_for(data_type) as i64);
            let expired = self.evidence.older_than(data_type, cutoff).await?;
            let mut deleted = 0;
            for meta in expired {
                match self.evidence.delete(&meta.id).await {
                    Ok(_) => deleted += 1,
                    Err(e) => {
                        warn!("Retention: failed to delete evidence {}: {}", meta.id, e);
                        report.evidence_failed += 1;
                    }
                }
            }
            if deleted > 0 {
                debug!("Retention: {} {} item(s) expired", deleted, data_type.as_str());
            }
            report.evidence_deleted.insert(data_type.as_str().to_string(), deleted);
        }

        let cutoff = now - ChronoDuration::days(self.config.violation_days as i64);
        if self.config.audit_snapshot {
            let rows = self.manager.rows_older_than(cutoff).await?;
            if !rows.is_empty() {
                tokio::fs::create_dir_all(&self.config.audit_dir).await?;
                let path = self
                    .config
                    .audit_dir
                    .join(format!("violations_audit_{}.json", now.format("%Y%m%d_%H%M%S")));
                tokio::fs::write(&path, serde_json::to_vec_pretty(&rows)?).await?;
                report.audit_file = Some(path);
            }
        }
        report.violations_deleted = self.manager.delete_older_than(cutoff).await?;

        info!(
            "Retention sweep: {} evidence item(s), {} violation row(s) removed",
            report.total_evidence_deleted(),
            report.violations_deleted
        );
        Ok(report)
    }

    /// Sweep on an interval until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Retention task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;
    use crate::storage::local::LocalStore;
    use crate::types::Severity;
    use crate::violations::{TrafficViolation, ViolationDetails, ViolationLocation, ViolationType};

    fn setup(dir: &std::path::Path) -> (Arc<ViolationManager>, Arc<EvidenceStore>) {
        let db = Database::new(dir.join("r.db")).unwrap();
        let evidence = Arc::new(EvidenceStore::new(
            db.clone(),
            Some(LocalStore::new(dir.join("ev"), false)),
            None,
            false,
            1024,
            Duration::from_secs(5),
        ));
        let manager = Arc::new(ViolationManager::new(db, evidence.clone(), Duration::from_secs(5)));
        (manager, evidence)
    }

    fn old_violation(days_ago: i64) -> TrafficViolation {
        TrafficViolation {
            violation_id: format!("v{days_ago}"),
            timestamp: Utc::now() - ChronoDuration::days(days_ago),
            frame_id: 1,
            frame_timestamp_ms: 0.0,
            violation_type: ViolationType::Lane,
            severity: Severity::Minor,
            vehicle_id: 1,
            description: "lane".into(),
            confidence: 0.6,
            location: ViolationLocation {
                zone_id: None,
                zone_name: None,
                coordinates: (0.0, 0.0),
            },
            details: ViolationDetails::Generic { note: String::new() },
            bbox: [0.0, 0.0, 5.0, 5.0],
            vehicle_class: "car".into(),
            license_plate: None,
            plate_confidence: None,
            detection_confidence: 0.8,
            tracking_quality: 1.0,
            camera_id: "cam".into(),
            evidence: vec![],
            reviewed: false,
            false_positive: false,
        }
    }

    #[tokio::test]
    async fn test_sweep_respects_per_type_windows() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, evidence) = setup(dir.path());
        let img = evidence.store(None, DataType::Image, vec![1; 8], vec![]).await.unwrap();
        let meta = evidence.store(None, DataType::Metadata, vec![2; 8], vec![]).await.unwrap();

        let config = RetentionConfig {
            audit_dir: dir.path().join("audit"),
            ..Default::default()
        };
        let policy = RetentionPolicy::new(config, manager, evidence.clone());
        // 100 days ahead: images (90d) expire, metadata (365d) stays.
        let report = policy.run_once(Utc::now() + ChronoDuration::days(100)).await.unwrap();
        assert_eq!(report.evidence_deleted.get("image"), Some(&1));
        assert_eq!(report.evidence_deleted.get("metadata"), Some(&0));
        assert!(evidence.metadata(&img.id).await.is_err());
        assert!(evidence.metadata(&meta.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_rows_snapshotted_before_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, evidence) = setup(dir.path());
        manager.record(&old_violation(400)).await.unwrap();
        manager.record(&old_violation(10)).await.unwrap();

        let config = RetentionConfig {
            audit_dir: dir.path().join("audit"),
            ..Default::default()
        };
        let policy = RetentionPolicy::new(config, manager.clone(), evidence);
        let report = policy.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.violations_deleted, 1);
        let audit = report.audit_file.unwrap();
        let rows: Vec<TrafficViolation> = serde_json::from_slice(&std::fs::read(audit).unwrap()).unwrap();
        assert_eq!(rows[0].violation_id, "v400");
        assert!(manager.get("v10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, evidence) = setup(dir.path());
        let policy = Arc::new(RetentionPolicy::new(RetentionConfig::default(), manager, evidence));
        let cancel = CancellationToken::new();
        let handle = policy.spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
