use anyhow::{Context, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::telemetry::{Notification, NotificationKind, Notifier};

pub const SUBJECT_PREFIX: &str = "gatekeep.notifications";

/// Subject format: gatekeep.notifications.{eventType}
pub fn subject_for(kind: NotificationKind) -> String {
    format!("{}.{}", SUBJECT_PREFIX, kind.as_str())
}

/// Publishes notifications to NATS JetStream for downstream delivery
/// (webhooks, email) by other services.
#[derive(Clone)]
pub struct NotificationPublisher {
    jetstream: jetstream::Context,
}

impl NotificationPublisher {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }
}

#[async_trait]
impl Notifier for NotificationPublisher {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let subject = subject_for(notification.kind);
        let envelope = json!({
            "eventType": notification.kind,
            "payload": notification.payload,
            "owner": notification.owner,
            "emittedAt": Utc::now(),
        });
        let payload = serde_json::to_vec(&envelope)
            .context("Failed to serialize notification to JSON")?;

        debug!(subject = %subject, "Publishing notification to NATS");

        self.jetstream
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("Failed to publish notification to subject '{}'", subject))?
            .await
            .context("Failed to await publish ack")?;

        Ok(())
    }
}
