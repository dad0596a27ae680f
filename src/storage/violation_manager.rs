// src/storage/violation_manager.rs
//
// Durable violation rows plus the read-only reporting queries over them.
// The full record is kept as JSON; columns mirror what queries filter on.
// Review fields and the plate are the only columns updated after insert.

use super::database::{format_ts, to_i64, Database};
use super::evidence::{DataType, EvidenceStore};
use super::with_timeout;
use crate::error::StorageError;
use crate::types::Severity;
use crate::violations::{EvidenceRef, TrafficViolation, ViolationType};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone)]
pub struct ViolationQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub violation_type: Option<ViolationType>,
    pub camera_id: Option<String>,
    pub license_plate: Option<String>,
    pub include_false_positives: bool,
    /// Newest rows first; `None` returns every match
    pub limit: Option<usize>,
}

impl Default for ViolationQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            violation_type: None,
            camera_id: None,
            license_plate: None,
            include_false_positives: false,
            limit: Some(100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationStatistics {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Excludes false positives
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_hour: BTreeMap<u32, u64>,
    pub by_camera: BTreeMap<String, u64>,
    pub reviewed: u64,
    pub false_positives: u64,
    /// Reviewed share of every row in range, false positives included
    pub resolution_rate: f64,
    pub false_positive_rate: f64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationCount {
    pub location: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffenderCount {
    pub license_plate: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationReport {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub statistics: ViolationStatistics,
    pub top_locations: Vec<LocationCount>,
    pub repeat_offenders: Vec<OffenderCount>,
}

const SELECT_ROW: &str =
    "SELECT record_json, license_plate, plate_confidence, reviewed, false_positive, evidence_json FROM violations";

fn row_to_violation(row: &Row) -> anyhow::Result<TrafficViolation> {
    let json: String = row.get(0)?;
    let mut v: TrafficViolation = serde_json::from_str(&json).context("corrupt record_json")?;
    v.license_plate = row.get(1)?;
    v.plate_confidence = row.get::<_, Option<f64>>(2)?.map(|c| c as f32);
    v.reviewed = row.get::<_, i64>(3)? != 0;
    v.false_positive = row.get::<_, i64>(4)? != 0;
    let evidence: String = row.get(5)?;
    v.evidence = serde_json::from_str(&evidence)?;
    Ok(v)
}

fn collect_rows(conn: &Connection, sql: &str, args: &[String]) -> anyhow::Result<Vec<TrafficViolation>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_violation(row)?);
    }
    Ok(out)
}

fn group_counts(conn: &Connection, sql: &str, from: &str, to: &str) -> anyhow::Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![from, to], |r| {
        Ok((r.get::<_, Option<String>>(0)?, r.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, count) = row?;
        out.push((key.unwrap_or_else(|| "unknown".into()), count.max(0) as u64));
    }
    Ok(out)
}

/// Range filter shared by the reporting queries; false positives excluded.
const IN_RANGE: &str = "timestamp >= ?1 AND timestamp < ?2 AND false_positive = 0";

fn statistics_in(conn: &Connection, from: DateTime<Utc>, to: DateTime<Utc>) -> anyhow::Result<ViolationStatistics> {
    let (f, t) = (format_ts(&from), format_ts(&to));
    let by = |column: &str| -> anyhow::Result<BTreeMap<String, u64>> {
        Ok(group_counts(
            conn,
            &format!("SELECT {column}, COUNT(*) FROM violations WHERE {IN_RANGE} GROUP BY {column}"),
            &f,
            &t,
        )?
        .into_iter()
        .collect())
    };
    let by_type = by("violation_type")?;
    let by_severity = by("severity")?;
    let by_camera = by("camera_id")?;
    let by_hour = by("substr(timestamp, 12, 2)")?
        .into_iter()
        .filter_map(|(h, n)| h.parse::<u32>().ok().map(|h| (h, n)))
        .collect();

    let (total, avg_conf): (i64, Option<f64>) = conn.query_row(
        &format!("SELECT COUNT(*), AVG(confidence) FROM violations WHERE {IN_RANGE}"),
        params![f, t],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let (all_rows, reviewed, false_positives): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN reviewed = 1 OR false_positive = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN false_positive = 1 THEN 1 ELSE 0 END), 0)
         FROM violations WHERE timestamp >= ?1 AND timestamp < ?2",
        params![f, t],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let denom = all_rows.max(1) as f64;

    Ok(ViolationStatistics {
        from,
        to,
        total: total.max(0) as u64,
        by_type,
        by_severity,
        by_hour,
        by_camera,
        reviewed: reviewed.max(0) as u64,
        false_positives: false_positives.max(0) as u64,
        resolution_rate: reviewed as f64 / denom,
        false_positive_rate: false_positives as f64 / denom,
        average_confidence: avg_conf.unwrap_or(0.0),
    })
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ViolationManager {
    db: Database,
    evidence: Arc<EvidenceStore>,
    timeout: Duration,
}

impl ViolationManager {
    pub fn new(db: Database, evidence: Arc<EvidenceStore>, timeout: Duration) -> Self {
        Self {
            db,
            evidence,
            timeout,
        }
    }

    pub fn evidence(&self) -> &Arc<EvidenceStore> {
        &self.evidence
    }

    /// The underlying database, for components sharing it (alert log).
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Validate and insert. Returns the violation id.
    pub async fn record(&self, violation: &TrafficViolation) -> Result<String, StorageError> {
        if let Err(e) = violation.validate() {
            warn!(
                "Refusing to store violation {}: {}",
                violation.violation_id, e
            );
            return Err(e.into());
        }
        let v = violation.clone();
        let record_json = serde_json::to_string(&v)?;
        let evidence_json = serde_json::to_string(&v.evidence)?;
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                conn.execute(
                    "INSERT INTO violations (id, timestamp, frame_id, violation_type, severity, vehicle_id,
                        vehicle_class, camera_id, zone_id, zone_name, confidence, measured_speed, speed_limit,
                        license_plate, plate_confidence, evidence_json, reviewed, false_positive, record_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    params![
                        v.violation_id,
                        format_ts(&v.timestamp),
                        to_i64(v.frame_id)?,
                        v.violation_type.as_str(),
                        v.severity.as_str(),
                        v.vehicle_id as i64,
                        v.vehicle_class,
                        v.camera_id,
                        v.location.zone_id,
                        v.location.zone_name,
                        v.confidence as f64,
                        v.measured_speed(),
                        v.speed_limit(),
                        v.license_plate,
                        v.plate_confidence.map(|c| c as f64),
                        evidence_json,
                        v.reviewed as i64,
                        v.false_positive as i64,
                        record_json,
                        format_ts(&Utc::now()),
                    ],
                )
                .context("failed to insert violation")?;
                Ok(())
            }),
        )
        .await?;
        Ok(violation.violation_id.clone())
    }

    /// Store evidence bytes and link them to the violation row.
    pub async fn attach_evidence(
        &self,
        violation_id: &str,
        data_type: DataType,
        data: Vec<u8>,
        tags: Vec<String>,
    ) -> Result<EvidenceRef, StorageError> {
        let meta = self
            .evidence
            .store(Some(violation_id), data_type, data, tags)
            .await?;
        let reference = EvidenceRef {
            storage_id: meta.id.clone(),
            data_type: data_type.as_str().to_string(),
            checksum: meta.checksum.clone(),
        };
        let id = violation_id.to_string();
        let r = reference.clone();
        let linked = with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT evidence_json FROM violations WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(existing) = existing else {
                    return Ok(false);
                };
                let mut refs: Vec<EvidenceRef> = serde_json::from_str(&existing)?;
                refs.push(r);
                tx.execute(
                    "UPDATE violations SET evidence_json = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&refs)?, id],
                )?;
                tx.commit()?;
                Ok(true)
            }),
        )
        .await?;
        if !linked {
            warn!(
                "Evidence {} stored but violation {} has no row",
                meta.id, violation_id
            );
        }
        Ok(reference)
    }

    /// Run one UPDATE keyed by violation id; true when a row changed.
    async fn update_row<P>(&self, sql: &'static str, args: P) -> Result<bool, StorageError>
    where
        P: rusqlite::Params + Send + 'static,
    {
        let changed = with_timeout(
            self.timeout,
            self.db.execute(move |conn| Ok(conn.execute(sql, args)?)),
        )
        .await?;
        Ok(changed > 0)
    }

    /// Fill in a plate that arrived after the record was written.
    pub async fn update_plate(&self, violation_id: &str, plate: &str, confidence: f32) -> Result<bool, StorageError> {
        self.update_row(
            "UPDATE violations SET license_plate = ?1, plate_confidence = ?2 WHERE id = ?3",
            (plate.to_string(), confidence as f64, violation_id.to_string()),
        )
        .await
    }

    /// Status mutation only; the row and its evidence stay.
    pub async fn mark_false_positive(&self, violation_id: &str, notes: Option<&str>) -> Result<bool, StorageError> {
        let changed = self
            .update_row(
                "UPDATE violations SET false_positive = 1, reviewed = 1,
                    review_notes = COALESCE(?1, review_notes), reviewed_at = ?2 WHERE id = ?3",
                (
                    notes.map(str::to_string),
                    format_ts(&Utc::now()),
                    violation_id.to_string(),
                ),
            )
            .await?;
        if changed {
            info!("Marked violation {} as false positive", violation_id);
        }
        Ok(changed)
    }

    pub async fn mark_reviewed(&self, violation_id: &str, reviewer: &str) -> Result<bool, StorageError> {
        self.update_row(
            "UPDATE violations SET reviewed = 1, reviewed_by = ?1, reviewed_at = ?2 WHERE id = ?3",
            (reviewer.to_string(), format_ts(&Utc::now()), violation_id.to_string()),
        )
        .await
    }

    pub async fn get(&self, violation_id: &str) -> Result<Option<TrafficViolation>, StorageError> {
        let id = violation_id.to_string();
        let rows = with_timeout(
            self.timeout,
            self.db
                .execute(move |conn| collect_rows(conn, &format!("{SELECT_ROW} WHERE id = ?1"), &[id])),
        )
        .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn query(&self, q: &ViolationQuery) -> Result<Vec<TrafficViolation>, StorageError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        let mut push = |clause: &str, value: String| {
            args.push(value);
            clauses.push(clause.replace('?', &format!("?{}", args.len())));
        };
        if let Some(from) = &q.from {
            push("timestamp >= ?", format_ts(from));
        }
        if let Some(to) = &q.to {
            push("timestamp < ?", format_ts(to));
        }
        if let Some(t) = q.violation_type {
            push("violation_type = ?", t.as_str().to_string());
        }
        if let Some(c) = &q.camera_id {
            push("camera_id = ?", c.clone());
        }
        if let Some(p) = &q.license_plate {
            push("license_plate = ?", p.clone());
        }
        if !q.include_false_positives {
            clauses.push("false_positive = 0".into());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit_sql = match q.limit {
            Some(n) => format!(" LIMIT {}", n.max(1)),
            None => String::new(),
        };
        let sql = format!("{SELECT_ROW}{where_sql} ORDER BY timestamp DESC{limit_sql}");
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| collect_rows(conn, &sql, &args)),
        )
        .await
    }

    /// Unreviewed, non-false-positive rows, most severe and most recent first.
    pub async fn review_queue(&self, limit: usize) -> Result<Vec<TrafficViolation>, StorageError> {
        let rank = Severity::all()
            .iter()
            .enumerate()
            .map(|(i, s)| format!("WHEN '{}' THEN {}", s.as_str(), i))
            .collect::<Vec<_>>()
            .join(" ");
        let sql = format!(
            "{SELECT_ROW} WHERE reviewed = 0 AND false_positive = 0
             ORDER BY CASE severity {rank} ELSE 0 END DESC, timestamp DESC LIMIT {}",
            limit.max(1)
        );
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| collect_rows(conn, &sql, &[])),
        )
        .await
    }

    pub async fn statistics(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<ViolationStatistics, StorageError> {
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| statistics_in(conn, from, to)),
        )
        .await
    }

    /// Statistics plus hotspot ranking (top 10 locations) and repeat
    /// offenders (plates seen more than once, top 10).
    pub async fn report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<ViolationReport, StorageError> {
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                let statistics = statistics_in(conn, from, to)?;
                let (f, t) = (format_ts(&from), format_ts(&to));
                let top_locations = group_counts(
                    conn,
                    &format!(
                        "SELECT COALESCE(zone_name, zone_id, camera_id) AS loc, COUNT(*) AS n FROM violations
                         WHERE {IN_RANGE} GROUP BY loc ORDER BY n DESC, loc LIMIT 10"
                    ),
                    &f,
                    &t,
                )?
                .into_iter()
                .map(|(location, count)| LocationCount { location, count })
                .collect();
                let repeat_offenders = group_counts(
                    conn,
                    &format!(
                        "SELECT license_plate, COUNT(*) AS n FROM violations
                         WHERE {IN_RANGE} AND license_plate IS NOT NULL AND license_plate != ''
                         GROUP BY license_plate HAVING n > 1 ORDER BY n DESC, license_plate LIMIT 10"
                    ),
                    &f,
                    &t,
                )?
                .into_iter()
                .map(|(license_plate, count)| OffenderCount { license_plate, count })
                .collect();
                let generated_at = Utc::now();
                Ok(ViolationReport {
                    report_id: format!("report_{}", generated_at.timestamp()),
                    generated_at,
                    statistics,
                    top_locations,
                    repeat_offenders,
                })
            }),
        )
        .await
    }

    /// Write every non-false-positive row in range as a JSON array.
    pub async fn export_json(&self, from: DateTime<Utc>, to: DateTime<Utc>, path: &Path) -> Result<usize, StorageError> {
        let rows = self
            .query(&ViolationQuery {
                from: Some(from),
                to: Some(to),
                limit: None,
                ..Default::default()
            })
            .await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&rows)?).await?;
        info!("Exported {} violations to {}", rows.len(), path.display());
        Ok(rows.len())
    }

    /// Every row (false positives included) older than `cutoff`, for audit.
    pub async fn rows_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<TrafficViolation>, StorageError> {
        let c = format_ts(&cutoff);
        with_timeout(
            self.timeout,
            self.db.execute(move |conn| {
                collect_rows(conn, &format!("{SELECT_ROW} WHERE timestamp < ?1 ORDER BY timestamp"), &[c])
            }),
        )
        .await
    }

    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let c = format_ts(&cutoff);
        with_timeout(
            self.timeout,
            self.db
                .execute(move |conn| Ok(conn.execute("DELETE FROM violations WHERE timestamp < ?1", params![c])?)),
        )
        .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStore;
    use crate::violations::{ViolationDetails, ViolationLocation};
    use chrono::TimeZone;

    fn manager(dir: &Path) -> ViolationManager {
        let db = Database::new(dir.join("v.db")).unwrap();
        let evidence = Arc::new(EvidenceStore::new(
            db.clone(),
            Some(LocalStore::new(dir.join("evidence"), true)),
            None,
            false,
            1 << 20,
            Duration::from_secs(5),
        ));
        ViolationManager::new(db, evidence, Duration::from_secs(5))
    }

    fn violation(id: &str, hour: u32, t: ViolationType, severity: Severity, plate: Option<&str>, zone: &str) -> TrafficViolation {
        TrafficViolation {
            violation_id: id.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, hour, 15, 0).unwrap(),
            frame_id: 100,
            frame_timestamp_ms: 3_300.0,
            violation_type: t,
            severity,
            vehicle_id: 7,
            description: "test".into(),
            confidence: 0.8,
            location: ViolationLocation {
                zone_id: Some(zone.to_lowercase()),
                zone_name: Some(zone.into()),
                coordinates: (10.0, 20.0),
            },
            details: ViolationDetails::Speed {
                measured_kmh: 80.0,
                limit_kmh: 60.0,
                amount_kmh: 20.0,
                percentage: 33.3,
            },
            bbox: [0.0, 0.0, 10.0, 10.0],
            vehicle_class: "car".into(),
            license_plate: plate.map(str::to_string),
            plate_confidence: plate.map(|_| 0.9),
            detection_confidence: 0.9,
            tracking_quality: 1.0,
            camera_id: "cam-1".into(),
            evidence: vec![],
            reviewed: false,
            false_positive: false,
        }
    }

    fn day() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_record_get_and_plate_update() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let v = violation("a", 9, ViolationType::Speeding, Severity::Moderate, None, "Main");
        m.record(&v).await.unwrap();
        assert!(m.update_plate("a", "ABC123", 0.7).await.unwrap());
        let got = m.get("a").await.unwrap().unwrap();
        assert_eq!(got.license_plate.as_deref(), Some("ABC123"));
        assert_eq!(got.measured_speed(), Some(80.0));
        assert!(m.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_record_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let mut v = violation("bad", 9, ViolationType::Speeding, Severity::Minor, None, "Main");
        v.confidence = 2.0;
        assert!(matches!(m.record(&v).await, Err(StorageError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_false_positive_excluded_from_queries_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.record(&violation("a", 9, ViolationType::Speeding, Severity::Moderate, None, "Main")).await.unwrap();
        m.record(&violation("b", 9, ViolationType::Lane, Severity::Minor, None, "Main")).await.unwrap();
        assert!(m.mark_false_positive("b", Some("shadow")).await.unwrap());
        assert!(!m.mark_false_positive("zzz", None).await.unwrap());

        assert_eq!(m.query(&ViolationQuery::default()).await.unwrap().len(), 1);
        let (from, to) = day();
        let s = m.statistics(from, to).await.unwrap();
        assert_eq!(s.total, 1);
        assert_eq!(s.false_positives, 1);
        assert!((s.false_positive_rate - 0.5).abs() < 1e-9);
        assert!((s.resolution_rate - 0.5).abs() < 1e-9);
        assert_eq!(s.by_hour.get(&9), Some(&1));
        assert_eq!(s.by_type.get("speeding"), Some(&1));
    }

    #[tokio::test]
    async fn test_report_hotspots_and_repeat_offenders() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let rows = [
            ("1", "Bridge", Some("AAA1")),
            ("2", "Bridge", Some("AAA1")),
            ("3", "Bridge", Some("BBB2")),
            ("4", "School", None),
        ];
        for (id, zone, plate) in rows {
            m.record(&violation(id, 14, ViolationType::Speeding, Severity::Severe, plate, zone))
                .await
                .unwrap();
        }
        let (from, to) = day();
        let r = m.report(from, to).await.unwrap();
        assert_eq!(r.top_locations[0], LocationCount { location: "Bridge".into(), count: 3 });
        assert_eq!(r.repeat_offenders, vec![OffenderCount { license_plate: "AAA1".into(), count: 2 }]);
        assert_eq!(r.statistics.total, 4);
    }

    #[tokio::test]
    async fn test_review_queue_orders_by_severity() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.record(&violation("minor", 10, ViolationType::Lane, Severity::Minor, None, "Z")).await.unwrap();
        m.record(&violation("crit", 8, ViolationType::WrongWay, Severity::Critical, None, "Z")).await.unwrap();
        m.record(&violation("done", 9, ViolationType::Lane, Severity::Severe, None, "Z")).await.unwrap();
        m.mark_reviewed("done", "officer-1").await.unwrap();
        let queue = m.review_queue(10).await.unwrap();
        let ids: Vec<_> = queue.iter().map(|v| v.violation_id.as_str()).collect();
        assert_eq!(ids, vec!["crit", "minor"]);
    }

    #[tokio::test]
    async fn test_attach_evidence_links_row() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.record(&violation("a", 9, ViolationType::Speeding, Severity::Moderate, None, "Main")).await.unwrap();
        let r = m.attach_evidence("a", DataType::Image, vec![1, 2, 3], vec![]).await.unwrap();
        let got = m.get("a").await.unwrap().unwrap();
        assert_eq!(got.evidence, vec![r.clone()]);
        let back = m.evidence().retrieve(&r.storage_id).await.unwrap();
        assert_eq!(back.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_query_limit_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        for (id, hour) in [("a", 8), ("b", 9), ("c", 10)] {
            m.record(&violation(id, hour, ViolationType::Speeding, Severity::Minor, None, "Main"))
                .await
                .unwrap();
        }
        let newest = m
            .query(&ViolationQuery { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        let ids: Vec<_> = newest.iter().map(|v| v.violation_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let all = m
            .query(&ViolationQuery { limit: None, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let (from, to) = day();
        assert_eq!(m.export_json(from, to, &dir.path().join("all.json")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_export_and_age_queries() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.record(&violation("a", 9, ViolationType::Speeding, Severity::Moderate, None, "Main")).await.unwrap();
        let (from, to) = day();
        let out = dir.path().join("exports/day.json");
        assert_eq!(m.export_json(from, to, &out).await.unwrap(), 1);
        let parsed: Vec<TrafficViolation> = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(parsed[0].violation_id, "a");

        assert_eq!(m.rows_older_than(to).await.unwrap().len(), 1);
        assert_eq!(m.delete_older_than(from).await.unwrap(), 0);
        assert_eq!(m.delete_older_than(to).await.unwrap(), 1);
    }
}
