//! Alert sink trait definition and shared types.

use std::collections::HashMap;

use watchpost_core::ConfigSnapshot;

/// Errors that can occur during alert delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport or authentication failure while delivering.
    #[error("SMTP delivery failed: {0}")]
    Delivery(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    /// Settings in the snapshot cannot be used (bad address, bad host).
    #[error("Configuration error: {0}")]
    Config(String),
}

/// An anomaly worth telling a human about.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Alert {
    pub message: String,
    pub equipment_id: String,
}

impl Alert {
    pub fn new(message: impl Into<String>, equipment_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            equipment_id: equipment_id.into(),
        }
    }
}

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// The rendered subject/title.
    pub subject: String,
    /// The rendered body content.
    pub body: String,
    /// Additional metadata (alert id, equipment).
    pub metadata: HashMap<String, String>,
}

/// A delivery channel for alerts.
///
/// Sinks receive the snapshot current at dispatch time and read their
/// addresses and credentials from it, so settings changed by a config
/// refresh apply from the next alert on.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver a notification through this channel.
    async fn deliver(
        &self,
        notification: &Notification,
        snapshot: &ConfigSnapshot,
    ) -> Result<(), NotifyError>;

    /// Test connectivity with a sample notification.
    async fn test(&self, snapshot: &ConfigSnapshot) -> Result<(), NotifyError> {
        let test_notification = Notification {
            subject: "[TEST] Anomaly Alert".to_string(),
            body: "This is a test notification from watchpost.".to_string(),
            metadata: HashMap::from([("event".to_string(), "test".to_string())]),
        };
        self.deliver(&test_notification, snapshot).await
    }

    /// Human-readable name for this channel (e.g., "email").
    fn channel_name(&self) -> &str;
}

/// Outcome of one successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub alert_id: String,
    pub channel: String,
    pub equipment_id: String,
    pub duration_ms: u64,
}
