//! In-memory event bus for tests/dev.
//!
//! Mirrors the semantics of the Redis Streams transport: consumer groups,
//! explicit ack/nack, a per-message delivery counter and a dead-letter list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{
    Acker, Delivery, DeliveryError, EventPublisher, EventSubscriber, PublishError, Subscription,
};
use crate::envelope::EventEnvelope;

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// A message that exhausted its deliveries (or was rejected outright).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub group: String,
    pub envelope: EventEnvelope,
    pub deliveries: u32,
    pub reason: String,
}

struct InFlight {
    envelope: EventEnvelope,
    attempt: u32,
}

struct Group {
    event_types: HashSet<String>,
    sender: mpsc::UnboundedSender<Delivery>,
    in_flight: HashMap<String, InFlight>,
}

impl Group {
    fn wants(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.contains(event_type)
    }
}

#[derive(Default)]
struct Inner {
    groups: HashMap<String, Group>,
    published: Vec<EventEnvelope>,
    dead_letters: Vec<DeadLetter>,
    injected_failures: VecDeque<PublishError>,
    next_token: u64,
}

/// In-memory pub/sub bus with consumer groups.
///
/// - Every group receives each matching message once per delivery attempt
/// - `nack` redelivers until `max_deliveries`, then dead-letters
/// - Cloning shares the same bus
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Inner>>,
    max_deliveries: u32,
}

impl core::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("max_deliveries", &self.max_deliveries)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_deliveries: max_deliveries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next publishes fail with the given errors, in order.
    pub fn fail_next_publishes(&self, errors: impl IntoIterator<Item = PublishError>) {
        self.lock().injected_failures.extend(errors);
    }

    /// Every envelope accepted so far, in publish order.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.lock().published.clone()
    }

    pub fn published_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.lock()
            .published
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Number of unsettled deliveries for `group`.
    pub fn in_flight(&self, group: &str) -> usize {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.in_flight.len())
            .unwrap_or(0)
    }

    fn acker(&self, group: &str) -> Arc<dyn Acker> {
        Arc::new(GroupAcker {
            bus: self.clone(),
            group: group.to_string(),
        })
    }

    fn deliver(&self, inner: &mut Inner, group_name: &str, envelope: EventEnvelope, attempt: u32) {
        inner.next_token += 1;
        let token = format!("{group_name}-{}", inner.next_token);
        let acker = self.acker(group_name);

        if let Some(group) = inner.groups.get_mut(group_name) {
            group.in_flight.insert(
                token.clone(),
                InFlight {
                    envelope: envelope.clone(),
                    attempt,
                },
            );
            if group
                .sender
                .send(Delivery::new(envelope, attempt, token, acker))
                .is_err()
            {
                // Consumer went away; the message stays in flight until it resubscribes.
                tracing::debug!(group = group_name, "subscriber dropped, delivery parked");
            }
        }
    }

    fn settle(&self, group: &str, token: &str) -> Result<InFlight, DeliveryError> {
        self.lock()
            .groups
            .get_mut(group)
            .and_then(|g| g.in_flight.remove(token))
            .ok_or_else(|| DeliveryError::UnknownDelivery(token.to_string()))
    }
}

struct GroupAcker {
    bus: InMemoryEventBus,
    group: String,
}

#[async_trait]
impl Acker for GroupAcker {
    async fn ack(&self, token: &str) -> Result<(), DeliveryError> {
        self.bus.settle(&self.group, token).map(|_| ())
    }

    async fn nack(&self, token: &str, reason: &str) -> Result<(), DeliveryError> {
        let entry = self.bus.settle(&self.group, token)?;
        let mut inner = self.bus.lock();

        if entry.attempt >= self.bus.max_deliveries {
            tracing::error!(
                group = %self.group,
                event_id = %entry.envelope.event_id(),
                deliveries = entry.attempt,
                reason,
                "delivery limit reached, dead-lettering"
            );
            inner.dead_letters.push(DeadLetter {
                group: self.group.clone(),
                envelope: entry.envelope,
                deliveries: entry.attempt,
                reason: reason.to_string(),
            });
            return Ok(());
        }

        self.bus
            .deliver(&mut inner, &self.group, entry.envelope, entry.attempt + 1);
        Ok(())
    }

    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), DeliveryError> {
        let entry = self.bus.settle(&self.group, token)?;
        self.bus.lock().dead_letters.push(DeadLetter {
            group: self.group.clone(),
            envelope: entry.envelope,
            deliveries: entry.attempt,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if let Some(err) = inner.injected_failures.pop_front() {
            return Err(err);
        }

        inner.published.push(envelope.clone());

        let targets: Vec<String> = inner
            .groups
            .iter()
            .filter(|(_, g)| g.wants(envelope.event_type()))
            .map(|(name, _)| name.clone())
            .collect();
        for group in targets {
            self.deliver(&mut inner, &group, envelope.clone(), 1);
        }
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InMemoryEventBus {
    /// Re-subscribing an existing group replaces its receiver and redelivers
    /// whatever was still in flight.
    async fn subscribe(
        &self,
        group: &str,
        event_types: &[&'static str],
    ) -> Result<Subscription, DeliveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let parked: Vec<InFlight> = match inner.groups.get_mut(group) {
            Some(existing) => {
                existing.sender = tx;
                existing.event_types = event_types.iter().map(|t| t.to_string()).collect();
                existing.in_flight.drain().map(|(_, v)| v).collect()
            }
            None => {
                inner.groups.insert(
                    group.to_string(),
                    Group {
                        event_types: event_types.iter().map(|t| t.to_string()).collect(),
                        sender: tx,
                        in_flight: HashMap::new(),
                    },
                );
                Vec::new()
            }
        };

        for entry in parked {
            self.deliver(&mut inner, group, entry.envelope, entry.attempt + 1);
        }
        Ok(Subscription::new(rx))
    }
}
