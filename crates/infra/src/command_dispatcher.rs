//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//! ```
//!
//! Publication of integration events is left to the caller, which gets both
//! the pre-command and post-command aggregate back.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use tradeflow_core::{Aggregate, AggregateId, DomainError, EventId, ExpectedVersion};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The aggregate rejected the command (deterministic).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another writer appended first; reload and retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// A historical payload no longer deserializes into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl DispatchError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched<A: Aggregate> {
    /// State the command was decided against.
    pub before: A,
    /// State after applying the new events.
    pub after: A,
    pub events: Vec<A::Event>,
    pub committed: Vec<StoredEvent>,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - Events are persisted before anything is returned; nothing is published here
/// - A stale version surfaces as [`DispatchError::Concurrency`]; callers retry by
///   dispatching again, which reloads the stream
#[derive(Debug)]
pub struct CommandDispatcher<S> {
    store: S,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> CommandDispatcher<S> {
    /// Rehydrate an aggregate from its stream.
    pub async fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id).await?;
        validate_loaded_stream(aggregate_id, &history)?;
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Load, decide, persist.
    ///
    /// Returns with no committed events if the command decided nothing.
    pub async fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Clone,
        A::Event: tradeflow_events::Event + Serialize + DeserializeOwned,
    {
        // 1) + 2) Load and rehydrate
        let before = self.load(aggregate_id, make_aggregate).await?;
        let expected = match before.version() {
            0 => ExpectedVersion::NoStream,
            v => ExpectedVersion::Exact(v),
        };

        // 3) Decide events (no mutation)
        let events = before.handle(command)?;
        if events.is_empty() {
            return Ok(Dispatched {
                after: before.clone(),
                before,
                events,
                committed: vec![],
            });
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, EventId::new(), ev))
            .collect::<Result<Vec<_>, _>>()?;
        let committed = self.store.append(aggregate_id, uncommitted, expected).await?;

        let mut after = before.clone();
        for ev in &events {
            after.apply(ev);
        }
        debug!(
            aggregate_id = %aggregate_id.as_uuid(),
            aggregate_type,
            version = after.version(),
            committed = committed.len(),
            "command committed"
        );

        Ok(Dispatched {
            before,
            after,
            events,
            committed,
        })
    }
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Sequence numbers must be contiguous from 1, so the version we rehydrate
    // to is the version we append against.
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "gap in loaded stream (expected sequence_number {expected}, found {})",
                e.sequence_number
            ))));
        }
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::Utc;
    use std::sync::Arc;
    use tradeflow_core::{Actor, AggregateRoot, CustomerId, OrderId};
    use tradeflow_sales::{CreateOrder, Order, OrderCommand, OrderStatus};

    const ORDER: &str = "sales.order";

    fn create(order_id: OrderId) -> OrderCommand {
        OrderCommand::CreateOrder(CreateOrder {
            order_id,
            customer_id: CustomerId::new(),
            actor: Actor::system("test"),
            occurred_at: Utc::now(),
        })
    }

    fn make(id: AggregateId) -> Order {
        Order::empty(OrderId::from_uuid(*id.as_uuid()))
    }

    #[tokio::test]
    async fn dispatch_persists_and_rehydrates() {
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new());
        let order_id = OrderId::new();

        let result = dispatcher
            .dispatch(order_id.stream_id(), ORDER, &create(order_id), make)
            .await
            .unwrap();
        assert_eq!(result.before.version(), 0);
        assert_eq!(result.after.version(), 1);
        assert_eq!(result.committed[0].sequence_number, 1);

        let loaded: Order = dispatcher.load(order_id.stream_id(), make).await.unwrap();
        assert_eq!(loaded.status(), OrderStatus::Pending);
        assert_eq!(loaded.version(), 1);
    }

    #[tokio::test]
    async fn domain_rejections_persist_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = CommandDispatcher::new(store.clone());
        let order_id = OrderId::new();
        dispatcher
            .dispatch(order_id.stream_id(), ORDER, &create(order_id), make)
            .await
            .unwrap();

        let err = dispatcher
            .dispatch(order_id.stream_id(), ORDER, &create(order_id), make)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(_)));
        assert_eq!(store.load_stream(order_id.stream_id()).await.unwrap().len(), 1);
    }
}
