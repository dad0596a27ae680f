// src/notification/mod.rs
//
// Alert fan-out. One alert per violation, routed by priority to the
// registered channels. Each channel has its own rate limiter and each
// delivery attempt is time-bounded; a failing channel never affects the
// others or the caller.

pub mod channels;
pub mod rate_limit;

pub use channels::{
    AlertSink, ChannelConfig, ChannelKind, DatabaseSink, DeliveryFuture, FileSink, LogSink,
    WebhookFormat, WebhookSink,
};
pub use rate_limit::RateLimiter;

use crate::error::NotifyError;
use crate::storage::Database;
use crate::types::Severity;
use crate::violations::{TrafficViolation, ViolationDetails};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

pub const DEFAULT_TEMPLATE: &str = "TRAFFIC VIOLATION: {violation_type} ({severity})\n\
Time: {timestamp}\n\
Location: {location}\n\
Vehicle: {vehicle_id} plate {plate}\n\
{description}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub channels: Vec<ChannelConfig>,
    /// Per delivery attempt
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub template: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: vec![
                ChannelConfig {
                    kind: ChannelKind::Database,
                    ..Default::default()
                },
                ChannelConfig {
                    kind: ChannelKind::Log,
                    ..Default::default()
                },
                ChannelConfig {
                    kind: ChannelKind::File,
                    path: Some(PathBuf::from("data/alerts.log")),
                    ..Default::default()
                },
            ],
            timeout_ms: 5_000,
            retry_attempts: 3,
            retry_delay_ms: 500,
            template: None,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertPriority {
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Self::Critical,
            Severity::Severe => Self::High,
            Severity::Moderate => Self::Medium,
            Severity::Minor => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub created_at: DateTime<Utc>,
    pub priority: AlertPriority,
    pub channels: Vec<ChannelKind>,
    pub message: String,
    pub violation: TrafficViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChannelOutcome {
    Delivered { attempts: u32 },
    RateLimited,
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub alert_id: String,
    pub outcomes: BTreeMap<ChannelKind, ChannelOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> Vec<ChannelKind> {
        self.with(|o| matches!(o, ChannelOutcome::Delivered { .. }))
    }

    pub fn rate_limited(&self) -> Vec<ChannelKind> {
        self.with(|o| matches!(o, ChannelOutcome::RateLimited))
    }

    pub fn failed(&self) -> Vec<ChannelKind> {
        self.with(|o| matches!(o, ChannelOutcome::Failed { .. }))
    }

    fn with(&self, pred: impl Fn(&ChannelOutcome) -> bool) -> Vec<ChannelKind> {
        self.outcomes
            .iter()
            .filter(|(_, o)| pred(o))
            .map(|(k, _)| *k)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub delivered: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotificationStats {
    pub total_alerts: u64,
    pub sent_alerts: u64,
    pub failed_alerts: u64,
    pub success_rate: f64,
    pub channels: BTreeMap<String, ChannelStats>,
}

// ============================================================================
// MESSAGE
// ============================================================================

/// Fill the placeholders of `template` from the violation.
pub fn render_message(template: &str, v: &TrafficViolation) -> String {
    let location = v
        .location
        .zone_name
        .clone()
        .or_else(|| v.location.zone_id.clone())
        .unwrap_or_else(|| v.camera_id.clone());
    let mut message = template
        .replace("{violation_type}", &v.violation_type.as_str().replace('_', " "))
        .replace("{severity}", &v.severity.as_str().to_uppercase())
        .replace("{vehicle_id}", &v.vehicle_id.to_string())
        .replace("{location}", &location)
        .replace("{timestamp}", &v.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .replace("{description}", &v.description)
        .replace("{plate}", v.license_plate.as_deref().unwrap_or("unknown"));
    if let ViolationDetails::Speed {
        measured_kmh,
        limit_kmh,
        amount_kmh,
        ..
    } = v.details
    {
        message.push_str(&format!(
            "\nSpeed: {measured_kmh:.1} km/h (limit {limit_kmh:.1}, +{amount_kmh:.1})"
        ));
    }
    message
}

// ============================================================================
// SYSTEM
// ============================================================================

struct Channel {
    sink: Arc<dyn AlertSink>,
    limiter: RateLimiter,
}

#[derive(Default)]
struct StatsInner {
    total: u64,
    sent: u64,
    failed: u64,
    channels: BTreeMap<ChannelKind, ChannelStats>,
}

pub struct NotificationSystem {
    enabled: bool,
    template: String,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    channels: Vec<Arc<Channel>>,
    stats: Mutex<StatsInner>,
}

impl NotificationSystem {
    /// A system with no channels; register sinks with `add_sink`.
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            enabled: config.enabled,
            template: config
                .template
                .clone()
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            channels: Vec::new(),
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Build the built-in sinks named by the config. Email and SMS have no
    /// transport here and are skipped unless injected with `add_sink`.
    pub fn from_config(config: &NotificationConfig, db: Option<Database>) -> Result<Self> {
        let mut system = Self::new(config);
        let client = reqwest::Client::builder()
            .timeout(system.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        for ch in config.channels.iter().filter(|c| c.enabled) {
            let sink: Arc<dyn AlertSink> = match ch.kind {
                ChannelKind::Log => Arc::new(LogSink),
                ChannelKind::File => Arc::new(FileSink::new(
                    ch.path.clone().unwrap_or_else(|| PathBuf::from("data/alerts.log")),
                )),
                ChannelKind::Database => match &db {
                    Some(db) => Arc::new(DatabaseSink::new(db.clone())),
                    None => {
                        warn!("Database channel configured without a database; skipped");
                        continue;
                    }
                },
                ChannelKind::Webhook | ChannelKind::Api => match &ch.url {
                    Some(url) => Arc::new(WebhookSink::new(ch.kind, client.clone(), url.clone(), ch)),
                    None => {
                        warn!("{} channel has no url; skipped", ch.kind.as_str());
                        continue;
                    }
                },
                ChannelKind::Email | ChannelKind::Sms => {
                    warn!(
                        "{} channel has no built-in transport; inject a sink to enable it",
                        ch.kind.as_str()
                    );
                    continue;
                }
            };
            system.add_sink(sink, ch.rate_limit_per_hour);
        }

        info!(
            "Notification system: {} channel(s) [{}]",
            system.channels.len(),
            system
                .channels
                .iter()
                .map(|c| c.sink.kind().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(system)
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AlertSink>, rate_limit_per_hour: Option<u32>) {
        self.add_sink_with_limiter(sink, RateLimiter::per_hour(rate_limit_per_hour));
    }

    pub fn add_sink_with_limiter(&mut self, sink: Arc<dyn AlertSink>, limiter: RateLimiter) {
        self.channels.push(Arc::new(Channel { sink, limiter }));
    }

    pub fn channel_kinds(&self) -> Vec<ChannelKind> {
        self.channels.iter().map(|c| c.sink.kind()).collect()
    }

    pub fn build_alert(&self, violation: &TrafficViolation) -> Alert {
        let priority = AlertPriority::from_severity(violation.severity);
        let created_at = Utc::now();
        let prefix: String = violation.violation_id.chars().take(8).collect();
        Alert {
            alert_id: format!("alert_{}_{}", created_at.timestamp_millis(), prefix),
            created_at,
            priority,
            channels: self
                .channels
                .iter()
                .map(|c| c.sink.kind())
                .filter(|k| k.accepts(priority))
                .collect(),
            message: render_message(&self.template, violation),
            violation: violation.clone(),
        }
    }

    /// Deliver to every channel routed for the violation's priority.
    /// Channels run concurrently; the call returns once all have settled.
    pub async fn notify(&self, violation: &TrafficViolation) -> DispatchReport {
        if !self.enabled {
            return DispatchReport::default();
        }
        let alert = Arc::new(self.build_alert(violation));
        let mut set = JoinSet::new();
        for channel in &self.channels {
            let kind = channel.sink.kind();
            if !kind.accepts(alert.priority) {
                continue;
            }
            let channel = channel.clone();
            let alert = alert.clone();
            let (timeout, attempts, delay) = (self.timeout, self.retry_attempts, self.retry_delay);
            set.spawn(async move {
                let outcome = deliver_with_retry(&channel, &alert, timeout, attempts, delay).await;
                (kind, outcome)
            });
        }

        let mut report = DispatchReport {
            alert_id: alert.alert_id.clone(),
            outcomes: BTreeMap::new(),
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((kind, outcome)) => {
                    report.outcomes.insert(kind, outcome);
                }
                Err(e) => warn!("Alert {} delivery task panicked: {}", alert.alert_id, e),
            }
        }
        self.record(&report);

        if !report.failed().is_empty() {
            warn!(
                "Alert {} failed via {:?}",
                report.alert_id,
                report.failed().iter().map(|k| k.as_str()).collect::<Vec<_>>()
            );
        }
        debug!(
            "Alert {} delivered via {:?}",
            report.alert_id,
            report.delivered().iter().map(|k| k.as_str()).collect::<Vec<_>>()
        );
        report
    }

    fn record(&self, report: &DispatchReport) {
        let mut stats = self.stats.lock();
        stats.total += 1;
        if report.delivered().is_empty() {
            stats.failed += 1;
        } else {
            stats.sent += 1;
        }
        for (kind, outcome) in &report.outcomes {
            let entry = stats.channels.entry(*kind).or_default();
            match outcome {
                ChannelOutcome::Delivered { .. } => entry.delivered += 1,
                ChannelOutcome::RateLimited => entry.rate_limited += 1,
                ChannelOutcome::Failed { .. } => entry.failed += 1,
            }
        }
    }

    pub fn stats(&self) -> NotificationStats {
        let stats = self.stats.lock();
        NotificationStats {
            total_alerts: stats.total,
            sent_alerts: stats.sent,
            failed_alerts: stats.failed,
            success_rate: stats.sent as f64 / stats.total.max(1) as f64,
            channels: stats
                .channels
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
        }
    }
}

async fn deliver_with_retry(
    channel: &Channel,
    alert: &Alert,
    timeout: Duration,
    attempts: u32,
    delay: Duration,
) -> ChannelOutcome {
    let Some(reservation) = channel.limiter.try_acquire() else {
        debug!(
            "Alert {} skipped on {}: rate limit",
            alert.alert_id,
            channel.sink.kind().as_str()
        );
        return ChannelOutcome::RateLimited;
    };

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(timeout, channel.sink.deliver(alert)).await {
            Ok(r) => r,
            Err(_) => Err(NotifyError::Timeout(timeout.as_millis() as u64)),
        };
        match result {
            Ok(()) => return ChannelOutcome::Delivered { attempts: attempt },
            Err(NotifyError::RateLimited(_)) => {
                channel.limiter.release(reservation);
                return ChannelOutcome::RateLimited;
            }
            Err(e) => {
                debug!(
                    "Alert {} attempt {}/{} on {} failed: {}",
                    alert.alert_id,
                    attempt,
                    attempts,
                    channel.sink.kind().as_str(),
                    e
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    channel.limiter.release(reservation);
    ChannelOutcome::Failed {
        attempts,
        error: last_error,
    }
}

// ============================================================================
// TESTS
// ============================================================================
