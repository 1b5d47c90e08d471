//! Event publishing/subscription port (mechanics only).
//!
//! The bus is the transport between services; it is not a store. Delivery is
//! **at-least-once** and unordered across event types, so every consumer gates
//! its side effects on the idempotency ledger.
//!
//! Consumption is explicit: each [`Delivery`] must be acked, nacked (redeliver
//! later) or dead-lettered. A delivery that is dropped without either is left
//! in flight and eventually reclaimed by the transport.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use tradeflow_core::EventId;

use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::event::IntegrationEvent;

/// Why a publish did not go through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be encoded. Retrying will not help.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The transport refused or lost the message.
    #[error("transport failure: {message}")]
    Transport { message: String, transient: bool },
}

impl PublishError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transport { transient: true, .. })
    }
}

impl From<EnvelopeError> for PublishError {
    fn from(value: EnvelopeError) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Failure of the subscribe / acknowledge side of the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("delivery {0} is no longer in flight")]
    UnknownDelivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Position in the submitted batch.
    pub index: usize,
    pub event_id: EventId,
    pub error: PublishError,
}

/// Per-event outcome of a batch publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPublishReport {
    pub attempted: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchPublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }
}

/// Sending half of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns once the transport has durably accepted the envelope.
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<(), PublishError>;

    /// Publish in order, reporting each failure by index.
    ///
    /// The default publishes one at a time and keeps going after a failure.
    async fn publish_batch_envelopes(&self, envelopes: Vec<EventEnvelope>) -> BatchPublishReport {
        let mut report = BatchPublishReport {
            attempted: envelopes.len(),
            failures: Vec::new(),
        };
        for (index, envelope) in envelopes.into_iter().enumerate() {
            let event_id = envelope.event_id();
            if let Err(error) = self.publish_envelope(envelope).await {
                report.failures.push(BatchFailure {
                    index,
                    event_id,
                    error,
                });
            }
        }
        report
    }
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        (**self).publish_envelope(envelope).await
    }

    async fn publish_batch_envelopes(&self, envelopes: Vec<EventEnvelope>) -> BatchPublishReport {
        (**self).publish_batch_envelopes(envelopes).await
    }
}

/// Typed publishing on top of any [`EventPublisher`].
#[async_trait]
pub trait EventPublisherExt: EventPublisher {
    async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), PublishError> {
        let envelope = EventEnvelope::wrap(event)?;
        self.publish_envelope(envelope).await
    }

    /// Publish many events of one type; serialization failures are reported at
    /// their own index and do not stop the rest of the batch.
    async fn publish_batch<E: IntegrationEvent>(&self, events: &[E]) -> BatchPublishReport {
        let mut failures = Vec::new();
        let mut wrapped = Vec::with_capacity(events.len());
        let mut positions = Vec::with_capacity(events.len());

        for (index, event) in events.iter().enumerate() {
            match EventEnvelope::wrap(event) {
                Ok(envelope) => {
                    wrapped.push(envelope);
                    positions.push(index);
                }
                Err(err) => failures.push(BatchFailure {
                    index,
                    event_id: event.event_id(),
                    error: err.into(),
                }),
            }
        }

        let sent = self.publish_batch_envelopes(wrapped).await;
        failures.extend(sent.failures.into_iter().map(|mut f| {
            f.index = positions.get(f.index).copied().unwrap_or(f.index);
            f
        }));
        failures.sort_by_key(|f| f.index);

        BatchPublishReport {
            attempted: events.len(),
            failures,
        }
    }
}

impl<P: EventPublisher + ?Sized> EventPublisherExt for P {}

/// Transport-side settlement of a delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, token: &str) -> Result<(), DeliveryError>;

    /// Return the message for redelivery (or dead-letter it once the transport's
    /// delivery limit is reached).
    async fn nack(&self, token: &str, reason: &str) -> Result<(), DeliveryError>;

    /// Move the message straight to the dead-letter destination.
    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), DeliveryError>;
}

/// One delivered message awaiting settlement.
pub struct Delivery {
    envelope: EventEnvelope,
    attempt: u32,
    token: String,
    acker: Arc<dyn Acker>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("event_id", &self.envelope.event_id())
            .field("event_type", &self.envelope.event_type())
            .field("attempt", &self.attempt)
            .field("token", &self.token)
            .finish()
    }
}

impl Delivery {
    pub fn new(
        envelope: EventEnvelope,
        attempt: u32,
        token: impl Into<String>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            envelope,
            attempt,
            token: token.into(),
            acker,
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn ack(self) -> Result<(), DeliveryError> {
        self.acker.ack(&self.token).await
    }

    pub async fn nack(self, reason: &str) -> Result<(), DeliveryError> {
        self.acker.nack(&self.token, reason).await
    }

    pub async fn dead_letter(self, reason: &str) -> Result<(), DeliveryError> {
        self.acker.dead_letter(&self.token, reason).await
    }
}

#[derive(Debug)]
enum Receiver {
    Unbounded(mpsc::UnboundedReceiver<Delivery>),
    Bounded(mpsc::Receiver<Delivery>),
}

/// Stream of deliveries for one consumer group.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            receiver: Receiver::Unbounded(receiver),
        }
    }

    /// A subscription whose transport stops reading while the channel is full.
    pub fn bounded(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            receiver: Receiver::Bounded(receiver),
        }
    }

    /// Wait for the next delivery; `None` once the transport closed the stream.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match &mut self.receiver {
            Receiver::Unbounded(rx) => rx.recv().await,
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        match &mut self.receiver {
            Receiver::Unbounded(rx) => rx.try_recv().ok(),
            Receiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Receiving half of the bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Join `group` for the given event types. Members of one group compete for
    /// messages; distinct groups each see every message.
    async fn subscribe(
        &self,
        group: &str,
        event_types: &[&'static str],
    ) -> Result<Subscription, DeliveryError>;
}

#[async_trait]
impl<S> EventSubscriber for Arc<S>
where
    S: EventSubscriber + ?Sized,
{
    async fn subscribe(
        &self,
        group: &str,
        event_types: &[&'static str],
    ) -> Result<Subscription, DeliveryError> {
        (**self).subscribe(group, event_types).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_transport_failures_are_retryable() {
        assert!(PublishError::transient("timeout").is_transient());
        assert!(!PublishError::permanent("unknown stream").is_transient());
        assert!(!PublishError::Serialization("bad".into()).is_transient());
    }

    #[test]
    fn report_counts_successes() {
        let report = BatchPublishReport {
            attempted: 3,
            failures: vec![BatchFailure {
                index: 1,
                event_id: EventId::new(),
                error: PublishError::transient("x"),
            }],
        };
        assert!(!report.is_complete());
        assert_eq!(report.succeeded(), 2);
    }
}
