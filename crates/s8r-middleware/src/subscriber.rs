//! The subscriber side of the event publisher.
//!
//! Subscribers receive [`DomainEvent`] batches from the
//! [`EventPublisher`][crate::publisher::EventPublisher] dispatcher.  Within a
//! batch, events of one subject appear in the order they were generated; no
//! ordering is promised across subjects.
//!
//! Delivery is at-least-once: a subscriber that returns
//! [`SubscriberError::Unavailable`] is offered the same batch again, so
//! implementations should tolerate seeing an event twice (the `event_id` is a
//! stable deduplication key).

use async_trait::async_trait;
use s8r_types::{DomainEvent, EventKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Why a subscriber did not accept a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// Temporary failure; the dispatcher retries the batch.
    #[error("subscriber unavailable: {0}")]
    Unavailable(String),

    /// The subscriber refuses this batch; it is not offered again.
    #[error("subscriber rejected batch: {0}")]
    Rejected(String),

    /// The subscriber is gone for good.
    #[error("subscriber closed")]
    Closed,
}

/// Consumer port for domain events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Accept a batch of events.
    async fn deliver(&self, batch: &[DomainEvent]) -> Result<(), SubscriberError>;
}

// ────────────────────────────────────────────────────────────────────────────
// LoggingSubscriber
// ────────────────────────────────────────────────────────────────────────────

/// Forwards every event to `tracing`.  Rejections and lineage anomalies are
/// logged at `warn`, everything else at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSubscriber;

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    fn name(&self) -> &str {
        "logging"
    }

    async fn deliver(&self, batch: &[DomainEvent]) -> Result<(), SubscriberError> {
        for event in batch {
            match event.kind() {
                EventKind::ValidationRejected | EventKind::LineageAnomaly => warn!(
                    subject = %event.subject_id,
                    event_id = %event.event_id,
                    payload = ?event.payload,
                    "domain event"
                ),
                kind => info!(
                    subject = %event.subject_id,
                    event_id = %event.event_id,
                    ?kind,
                    "domain event"
                ),
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ChannelSubscriber
// ────────────────────────────────────────────────────────────────────────────

/// Forwards events into a Tokio mpsc channel, one message per event.
///
/// The channel is bounded, so a slow receiver applies back-pressure to the
/// dispatcher rather than to the kernel.
pub struct ChannelSubscriber {
    name: String,
    sender: mpsc::Sender<DomainEvent>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving half of its channel.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

#[async_trait]
impl EventSubscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &[DomainEvent]) -> Result<(), SubscriberError> {
        for event in batch {
            self.sender
                .send(event.clone())
                .await
                .map_err(|_| SubscriberError::Closed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s8r_types::{EventPayload, LifecycleState, SubjectId};

    fn state_changed(subject: SubjectId) -> DomainEvent {
        DomainEvent::new(
            subject,
            EventPayload::StateChanged {
                from: LifecycleState::Conception,
                to: LifecycleState::Initializing,
            },
        )
    }

    #[tokio::test]
    async fn channel_subscriber_forwards_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (sub, mut rx) = ChannelSubscriber::new("test", 8);
        let subject = SubjectId::new();
        let batch = vec![state_changed(subject), state_changed(subject)];

        sub.deliver(&batch).await?;
        assert_eq!(rx.recv().await.ok_or("missing first")?.event_id, batch[0].event_id);
        assert_eq!(rx.recv().await.ok_or("missing second")?.event_id, batch[1].event_id);
        Ok(())
    }

    #[tokio::test]
    async fn channel_subscriber_reports_closed_receiver() {
        let (sub, rx) = ChannelSubscriber::new("test", 1);
        drop(rx);
        let result = sub.deliver(&[state_changed(SubjectId::new())]).await;
        assert_eq!(result, Err(SubscriberError::Closed));
    }

    #[tokio::test]
    async fn logging_subscriber_accepts_everything() {
        let batch = [state_changed(SubjectId::new())];
        assert!(LoggingSubscriber.deliver(&batch).await.is_ok());
        assert_eq!(LoggingSubscriber.name(), "logging");
    }
}
