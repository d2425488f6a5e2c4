// NATS JetStream delivery for owner notifications

mod client;
mod publisher;

pub use client::{NatsClient, NatsConfig};
pub use publisher::{subject_for, NotificationPublisher, SUBJECT_PREFIX};
