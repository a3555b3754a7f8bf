//! Typed alerts and the sink boundary.
//!
//! The engine emits [`Alert`]s through an [`AlertSink`]; transports
//! (Telegram, Slack, Sentry) live outside the crate. The default sink
//! logs the alert as structured JSON on the `alert` tracing target so
//! log-shipping pipelines can pick it up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A single alert event.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            title: title.into(),
            message: message.into(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Alert transport boundary. Implementations are expected to be cheap and
/// non-blocking; rate limiting and deduplication happen in the transport.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// Default sink: structured JSON on the `alert` tracing target.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: Alert) {
        let json = serde_json::to_string(&alert).unwrap_or_default();
        match alert.severity {
            AlertSeverity::Info | AlertSeverity::Low => {
                info!(target: "alert", "ALERT: {}", json)
            }
            AlertSeverity::Medium => warn!(target: "alert", "ALERT: {}", json),
            AlertSeverity::High | AlertSeverity::Critical => {
                error!(target: "alert", "ALERT: {}", json)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::High > AlertSeverity::Medium);
        assert!(AlertSeverity::Info < AlertSeverity::Low);
    }

    #[test]
    fn test_alert_builder() {
        let alert = Alert::new(AlertSeverity::High, "Hedge imbalance", "gap 12%")
            .with_tag("risk")
            .with_metadata("token", "BTC");
        assert_eq!(alert.tags, vec!["risk"]);
        assert_eq!(alert.metadata.get("token").map(String::as_str), Some("BTC"));
    }

    #[test]
    fn test_capturing_sink() {
        let sink = test_support::CapturingAlertSink::default();
        sink.emit(Alert::new(AlertSeverity::Info, "hello", "world"));
        assert!(sink.contains_title("hello"));
    }
}
