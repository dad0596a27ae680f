// src/notification/channels.rs
//
// Delivery sinks. Each channel is an independent `AlertSink`; the
// dispatcher never knows what is behind one.

use super::{Alert, AlertPriority};
use crate::error::NotifyError;
use crate::storage::database::{format_ts, Database};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Database,
    File,
    Webhook,
    Log,
    Email,
    Sms,
    Api,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::File => "file",
            Self::Webhook => "webhook",
            Self::Log => "log",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Api => "api",
        }
    }

    /// Whether alerts of this priority are routed to this channel.
    pub fn accepts(&self, priority: AlertPriority) -> bool {
        match priority {
            AlertPriority::Critical => true,
            AlertPriority::High => *self != Self::File,
            AlertPriority::Medium => matches!(self, Self::Database | Self::File | Self::Webhook | Self::Log),
            AlertPriority::Low => matches!(self, Self::Database | Self::File | Self::Log),
        }
    }
}

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

pub trait AlertSink: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookFormat {
    #[default]
    Generic,
    Slack,
    Telegram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub enabled: bool,
    /// Max deliveries per rolling hour
    pub rate_limit_per_hour: Option<u32>,
    /// File channel target
    pub path: Option<PathBuf>,
    /// Webhook / API endpoint
    pub url: Option<String>,
    pub format: WebhookFormat,
    /// Telegram chat id
    pub chat_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Log,
            enabled: true,
            rate_limit_per_hour: None,
            path: None,
            url: None,
            format: WebhookFormat::Generic,
            chat_id: None,
            headers: BTreeMap::new(),
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

pub struct LogSink;

impl AlertSink for LogSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async move {
            match alert.priority {
                AlertPriority::Critical | AlertPriority::High => warn!(
                    "[{}] {} {}: {}",
                    alert.violation.camera_id,
                    alert.priority.as_str().to_uppercase(),
                    alert.alert_id,
                    alert.violation.description
                ),
                _ => info!(
                    "[{}] {} {}: {}",
                    alert.violation.camera_id,
                    alert.priority.as_str().to_uppercase(),
                    alert.alert_id,
                    alert.violation.description
                ),
            }
            Ok(())
        })
    }
}

/// Appends a human-readable entry per alert.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn entry(alert: &Alert) -> String {
        format!(
            "[{}] {} - {}\n{}\n{}\n",
            alert.created_at.format("%Y-%m-%d %H:%M:%S"),
            alert.priority.as_str().to_uppercase(),
            alert.alert_id,
            alert.message,
            "-".repeat(80)
        )
    }
}

impl AlertSink for FileSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::File
    }

    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let io = |e: std::io::Error| NotifyError::Delivery(format!("{}: {e}", self.path.display()));
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io)?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(io)?;
            file.write_all(Self::entry(alert).as_bytes()).await.map_err(io)?;
            file.flush().await.map_err(io)?;
            Ok(())
        })
    }
}

/// HTTP POST. Also backs the `api` channel with the generic payload.
pub struct WebhookSink {
    kind: ChannelKind,
    client: reqwest::Client,
    url: String,
    format: WebhookFormat,
    chat_id: Option<String>,
    headers: BTreeMap<String, String>,
}

impl WebhookSink {
    pub fn new(kind: ChannelKind, client: reqwest::Client, url: String, config: &ChannelConfig) -> Self {
        Self {
            kind,
            client,
            url,
            format: config.format,
            chat_id: config.chat_id.clone(),
            headers: config.headers.clone(),
        }
    }

    pub fn payload(&self, alert: &Alert) -> serde_json::Value {
        match self.format {
            WebhookFormat::Slack => serde_json::json!({ "text": alert.message }),
            WebhookFormat::Telegram => serde_json::json!({
                "chat_id": self.chat_id,
                "text": alert.message,
            }),
            WebhookFormat::Generic => {
                let v = &alert.violation;
                serde_json::json!({
                    "alert_id": alert.alert_id,
                    "timestamp": format_ts(&alert.created_at),
                    "priority": alert.priority.as_str(),
                    "violation": {
                        "id": v.violation_id,
                        "type": v.violation_type.as_str(),
                        "severity": v.severity.as_str(),
                        "description": v.description,
                        "vehicle_id": v.vehicle_id,
                        "camera_id": v.camera_id,
                        "location": v.location,
                        "speed_limit": v.speed_limit(),
                        "measured_speed": v.measured_speed(),
                        "license_plate": v.license_plate,
                        "confidence": v.confidence,
                    },
                    "message": alert.message,
                })
            }
        }
    }
}

impl AlertSink for WebhookSink {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.post(&self.url).json(&self.payload(alert));
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let response = request.send().await?;
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(NotifyError::RateLimited(self.kind.as_str().to_string()));
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<no body>".to_string());
                return Err(NotifyError::Delivery(format!("HTTP {status}: {body}")));
            }
            Ok(())
        })
    }
}

/// Records each alert in the `alerts` table.
pub struct DatabaseSink {
    db: Database,
}

impl DatabaseSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl AlertSink for DatabaseSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Database
    }

    fn deliver<'a>(&'a self, alert: &'a Alert) -> DeliveryFuture<'a> {
        Box::pin(async move {
            let channels: Vec<&str> = alert.channels.iter().map(|c| c.as_str()).collect();
            let channels_json =
                serde_json::to_string(&channels).map_err(|e| NotifyError::Delivery(e.to_string()))?;
            let row = (
                alert.alert_id.clone(),
                format_ts(&alert.created_at),
                alert.priority.as_str(),
                alert.violation.violation_id.clone(),
                alert.violation.violation_type.as_str(),
                alert.message.clone(),
                channels_json,
            );
            self.db
                .execute(move |conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO alerts
                            (alert_id, created_at, priority, violation_id, violation_type, message, channels_json)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        row,
                    )?;
                    Ok(())
                })
                .await
                .map_err(|e| NotifyError::Delivery(format!("{e:#}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::tests::sample_alert;

    #[test]
    fn test_priority_routing_table() {
        use AlertPriority::*;
        assert!(ChannelKind::File.accepts(Critical));
        assert!(!ChannelKind::File.accepts(High));
        assert!(ChannelKind::Email.accepts(High));
        assert!(ChannelKind::Webhook.accepts(Medium));
        assert!(!ChannelKind::Sms.accepts(Medium));
        assert!(!ChannelKind::Webhook.accepts(Low));
        assert!(ChannelKind::Log.accepts(Low));
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/alerts.log");
        let sink = FileSink::new(&path);
        let alert = sample_alert();
        sink.deliver(&alert).await.unwrap();
        sink.deliver(&alert).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches(&alert.alert_id).count(), 2);
    }

    #[tokio::test]
    async fn test_database_sink_inserts_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("a.db")).unwrap();
        let sink = DatabaseSink::new(db.clone());
        sink.deliver(&sample_alert()).await.unwrap();
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_webhook_payload_shapes() {
        let alert = sample_alert();
        let mut config = ChannelConfig {
            kind: ChannelKind::Webhook,
            ..Default::default()
        };
        let client = reqwest::Client::new();

        let generic = WebhookSink::new(ChannelKind::Webhook, client.clone(), "http://x".into(), &config);
        let p = generic.payload(&alert);
        assert_eq!(p["violation"]["type"], "speeding");
        assert_eq!(p["alert_id"], alert.alert_id.as_str());

        config.format = WebhookFormat::Telegram;
        config.chat_id = Some("42".into());
        let tg = WebhookSink::new(ChannelKind::Webhook, client, "http://x".into(), &config);
        let p = tg.payload(&alert);
        assert_eq!(p["chat_id"], "42");
        assert_eq!(p["text"], alert.message.as_str());
    }
}
