use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::keys::Owner;

/// Kinds of notification raised by usage processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    #[serde(rename = "usage.threshold")]
    UsageThreshold,
    #[serde(rename = "quota.exceeded")]
    QuotaExceeded,
    #[serde(rename = "error_rate")]
    ErrorRate,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::UsageThreshold => "usage.threshold",
            NotificationKind::QuotaExceeded => "quota.exceeded",
            NotificationKind::ErrorRate => "error_rate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "eventType")]
    pub kind: NotificationKind,
    pub payload: Value,
    pub owner: Option<Owner>,
}

/// Delivers notifications to key owners or operators.
///
/// Delivery is best effort. Callers log a failed delivery and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log. Used when no broker is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let owner = notification
            .owner
            .as_ref()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            kind = notification.kind.as_str(),
            owner = %owner,
            payload = %notification.payload,
            "Notification"
        );
        Ok(())
    }
}
