// src/main.rs

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use traffic_violation::notification::{NotificationStats, NotificationSystem};
use traffic_violation::pipeline::{
    open_source, AggregateMetrics, MultiStreamManager, OcrPool, PipelineServices,
    ReplayPlateReader, SourceFactory, StreamStatus,
};
use traffic_violation::storage::{self, RetentionPolicy, ViolationReport};
use traffic_violation::AppConfig;

#[derive(Serialize)]
struct RunSummary {
    streams: Vec<StreamStatus>,
    aggregate: AggregateMetrics,
    notifications: NotificationStats,
    report: Option<ViolationReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚦 Traffic violation analysis starting");
    if !Path::new(&config_path).exists() {
        warn!("{} not found, running with defaults", config_path);
    }

    let (violations, evidence) = storage::open(&config.storage).context("opening storage")?;
    info!("✓ Storage ready at {}", config.storage.database_path.display());

    let notifier = Arc::new(
        NotificationSystem::from_config(
            &config.notifications,
            Some(violations.database().clone()),
        )
        .context("building notification channels")?,
    );
    info!("✓ Notification channels: {:?}", notifier.channel_kinds());

    let cancel = CancellationToken::new();
    let retention = config.storage.retention.enabled.then(|| {
        Arc::new(RetentionPolicy::new(
            config.storage.retention.clone(),
            violations.clone(),
            evidence.clone(),
        ))
        .spawn(cancel.child_token())
    });

    let ocr = if config.pipeline.ocr.enabled {
        Some(Arc::new(
            OcrPool::new(&config.pipeline.ocr, Arc::new(ReplayPlateReader))
                .context("starting OCR workers")?,
        ))
    } else {
        None
    };

    let services = PipelineServices {
        storage: Some(violations.clone()),
        notifier: Some(notifier.clone()),
        ocr,
    };
    let factory: SourceFactory = Arc::new(open_source);
    let manager = MultiStreamManager::new(config.manager_settings(), services, factory);

    for stream in &config.streams {
        if let Err(e) = manager.add_stream(stream.clone()) {
            error!("Skipping stream {}: {}", stream.stream_id, e);
        }
    }
    if manager.stream_count() == 0 {
        warn!("No streams configured");
    }
    let started = manager.start_all();
    info!("✓ {} stream(s) started", started);

    tokio::select! {
        _ = manager.wait_until_idle(Duration::from_millis(500)) => {
            info!("All streams finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping streams");
        }
    }
    manager.stop_all().await;

    cancel.cancel();
    if let Some(handle) = retention {
        if let Err(e) = handle.await {
            warn!("Retention task ended abnormally: {}", e);
        }
    }

    let now = Utc::now();
    let report = match violations.report(now - chrono::Duration::days(1), now).await {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("Report unavailable: {}", e);
            None
        }
    };
    let summary = RunSummary {
        streams: manager.statuses(),
        aggregate: manager.aggregate(),
        notifications: notifier.stats(),
        report,
    };
    info!(
        "Processed {} frames across {} stream(s); {} violations",
        summary.aggregate.total_processed,
        summary.aggregate.total_streams,
        summary.aggregate.total_violations
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
