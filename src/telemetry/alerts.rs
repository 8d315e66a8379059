//! Alert management for notifications

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::TelemetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn emoji(&self) -> &str {
        match self {
            AlertLevel::Warning => "⚠️",
            AlertLevel::Critical => "🚨",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, title, message)
    }

    pub fn critical(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, title, message)
    }

    /// Webhook body
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "text": format!("{} *{}*\n{}", self.level.emoji(), self.title, self.message),
            "level": self.level,
            "timestamp": self.timestamp,
        });
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

pub struct AlertManager {
    enabled: bool,
    webhook_url: Option<String>,
    http_client: reqwest::Client,
}

impl AlertManager {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            enabled: config.enable_alerts,
            webhook_url: config.alert_webhook.clone(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn send(&self, alert: Alert) {
        if !self.enabled {
            return;
        }

        match alert.level {
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("[CRITICAL] {}: {}", alert.title, alert.message),
        }

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.send_webhook(url, &alert).await {
                warn!("Failed to send webhook alert: {}", e);
            }
        }
    }

    async fn send_webhook(&self, url: &str, alert: &Alert) -> Result<()> {
        self.http_client
            .post(url)
            .json(&alert.payload())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_details() {
        let alert = Alert::critical("EURUSD_H1", "retrain budget exhausted")
            .with_details(serde_json::json!({ "attempts": 3 }));
        let payload = alert.payload();
        assert_eq!(payload["level"], "critical");
        assert_eq!(payload["details"]["attempts"], 3);
        assert!(payload["text"].as_str().unwrap().contains("EURUSD_H1"));
    }

    #[test]
    fn test_pair_alert_is_a_warning() {
        let payload = Alert::warning("EURUSD pair", "permission RED").payload();
        assert_eq!(payload["level"], "warning");
        assert!(payload.get("details").is_none());
    }

    #[tokio::test]
    async fn test_disabled_manager_is_silent() {
        let manager = AlertManager::new(&TelemetryConfig::default());
        assert!(!manager.is_enabled());
        manager.send(Alert::warning("pair", "RED")).await;
    }
}
