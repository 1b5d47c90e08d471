//! Sales application service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use tradeflow_core::{
    Actor, Aggregate, AggregateId, CorrelationId, CustomerId, Money, OrderId, ProductId,
};
use tradeflow_events::{
    EventEnvelope, EventHandler, EventPublisher, HandlerError, HandlerOutcome, IdempotencyLedger,
    IntegrationEvent, LedgerError, ProcessedEvent, ProcessingDecision, StockReservationFailed,
};
use tradeflow_sales::{
    AddItem, CancelOrder, ConfirmOrder, CreateOrder, MarkFulfilled, Order, OrderCommand,
    OrderEvent, OrderStatus, RemoveItem, SalesIntegrationEvent, UpdateItemQuantity,
};

use super::ServiceError;
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;

/// Aggregate type recorded on every order stream event.
pub const ORDER_AGGREGATE: &str = "sales.order";

/// Actor for cancellations triggered by Inventory's failure events.
pub const SAGA_ACTOR: &str = "inventory-saga";

/// Reload-and-retry budget for optimistic concurrency conflicts.
const MAX_DISPATCH_ATTEMPTS: u32 = 3;

fn make_order(id: AggregateId) -> Order {
    Order::empty(OrderId::from_uuid(*id.as_uuid()))
}

/// Order lifecycle operations.
///
/// Every operation appends to the order's stream and then publishes the
/// integration events the new stream events imply. If publishing fails after
/// the append, the error is returned and [`OrderService::republish`] can
/// resend; integration event ids are deterministic, so consumers dedupe.
#[derive(Debug)]
pub struct OrderService<S, P> {
    dispatcher: CommandDispatcher<S>,
    publisher: P,
}

impl<S: EventStore, P: EventPublisher> OrderService<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store),
            publisher,
        }
    }

    pub async fn load(&self, order_id: OrderId) -> Result<Order, ServiceError> {
        let order = self.dispatcher.load(order_id.stream_id(), make_order).await?;
        if !order.exists() {
            return Err(tradeflow_core::DomainError::not_found().into());
        }
        Ok(order)
    }

    pub async fn create_order(
        &self,
        customer_id: CustomerId,
        actor: Actor,
    ) -> Result<Order, ServiceError> {
        let order_id = OrderId::new();
        self.execute(
            OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id,
                actor,
                occurred_at: Utc::now(),
            }),
            None,
        )
        .await
    }

    pub async fn add_item(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        product_name: impl Into<String>,
        quantity: i64,
        unit_price: Money,
        actor: Actor,
    ) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::AddItem(AddItem {
                order_id,
                product_id,
                product_name: product_name.into(),
                quantity,
                unit_price,
                actor,
                occurred_at: Utc::now(),
            }),
            None,
        )
        .await
    }

    pub async fn remove_item(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        actor: Actor,
    ) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                product_id,
                actor,
                occurred_at: Utc::now(),
            }),
            None,
        )
        .await
    }

    pub async fn update_item_quantity(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: i64,
        actor: Actor,
    ) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::UpdateItemQuantity(UpdateItemQuantity {
                order_id,
                product_id,
                quantity,
                actor,
                occurred_at: Utc::now(),
            }),
            None,
        )
        .await
    }

    pub async fn confirm(
        &self,
        order_id: OrderId,
        actor: Actor,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                actor,
                occurred_at: Utc::now(),
            }),
            correlation_id,
        )
        .await
    }

    pub async fn mark_fulfilled(&self, order_id: OrderId, actor: Actor) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::MarkFulfilled(MarkFulfilled {
                order_id,
                actor,
                occurred_at: Utc::now(),
            }),
            None,
        )
        .await
    }

    pub async fn cancel(
        &self,
        order_id: OrderId,
        actor: Actor,
        reason: Option<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Order, ServiceError> {
        self.execute(
            OrderCommand::CancelOrder(CancelOrder {
                order_id,
                actor,
                reason,
                occurred_at: Utc::now(),
            }),
            correlation_id,
        )
        .await
    }

    /// Dispatch `command`, then publish its integration events.
    #[instrument(skip(self, command, correlation_id), fields(order_id = %command.order_id()), err)]
    pub async fn execute(
        &self,
        command: OrderCommand,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Order, ServiceError> {
        let order_id = command.order_id();
        let mut attempt = 0;
        let dispatched = loop {
            attempt += 1;
            match self
                .dispatcher
                .dispatch(order_id.stream_id(), ORDER_AGGREGATE, &command, make_order)
                .await
            {
                Ok(dispatched) => break dispatched,
                Err(DispatchError::Concurrency(msg)) if attempt < MAX_DISPATCH_ATTEMPTS => {
                    debug!(attempt, %msg, "order stream moved, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        let integration = integration_events(dispatched.before, &dispatched.events, correlation_id)?;
        self.publish_all(&integration).await?;
        Ok(dispatched.after)
    }

    /// Re-derive every integration event from the order's stream and publish
    /// them again.
    #[instrument(skip(self, correlation_id), fields(order_id = %order_id), err)]
    pub async fn republish(
        &self,
        order_id: OrderId,
        correlation_id: Option<CorrelationId>,
    ) -> Result<usize, ServiceError> {
        let history = self
            .dispatcher
            .store()
            .load_stream(order_id.stream_id())
            .await
            .map_err(DispatchError::from)?;
        let events = history
            .iter()
            .map(|stored| {
                serde_json::from_value::<OrderEvent>(stored.payload.clone())
                    .map_err(|e| DispatchError::Deserialize(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let integration = integration_events(make_order(order_id.stream_id()), &events, correlation_id)?;
        self.publish_all(&integration).await?;
        Ok(integration.len())
    }

    async fn publish_all(&self, events: &[SalesIntegrationEvent]) -> Result<(), ServiceError> {
        for event in events {
            let envelope = event.to_envelope()?;
            debug!(
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                "publishing order event"
            );
            self.publisher.publish_envelope(envelope).await?;
        }
        Ok(())
    }
}

/// Fold `events` onto `order`, collecting the integration events they imply.
fn integration_events(
    mut order: Order,
    events: &[OrderEvent],
    correlation_id: Option<CorrelationId>,
) -> Result<Vec<SalesIntegrationEvent>, ServiceError> {
    let mut out = Vec::new();
    for event in events {
        order.apply(event);
        if let Some(integration) =
            SalesIntegrationEvent::from_order_event(&order, event, correlation_id.clone())?
        {
            out.push(integration);
        }
    }
    Ok(out)
}

/// Cancels orders Inventory could not reserve stock for.
pub struct SalesSagaHandler<S, P, L> {
    orders: Arc<OrderService<S, P>>,
    ledger: L,
}

impl<S, P, L> SalesSagaHandler<S, P, L> {
    pub fn new(orders: Arc<OrderService<S, P>>, ledger: L) -> Self {
        Self { orders, ledger }
    }
}

impl<S, P, L> SalesSagaHandler<S, P, L>
where
    S: EventStore,
    P: EventPublisher,
    L: IdempotencyLedger,
{
    async fn compensate(&self, failed: &StockReservationFailed) -> Result<HandlerOutcome, ServiceError> {
        let event_id = failed.event_id();
        if self.ledger.try_begin_processing(event_id).await? == ProcessingDecision::AlreadyProcessed {
            debug!(%event_id, "reservation failure already handled");
            return Ok(HandlerOutcome::Duplicate);
        }

        let reason = format!("stock reservation failed: {}", failed.reason);
        let correlation_id = failed.correlation_id().cloned();
        let result = self
            .orders
            .cancel(
                failed.order_id,
                Actor::system(SAGA_ACTOR),
                Some(reason),
                correlation_id.clone(),
            )
            .await;

        let (outcome, detail) = match result {
            Ok(_) => {
                info!(order_id = %failed.order_id, "order cancelled after reservation failure");
                (HandlerOutcome::Applied, None)
            }
            Err(e) if e.is_conflict() => {
                // Already cancelled (maybe by an earlier attempt whose publish
                // failed): make sure Inventory saw the cancellation.
                if let Ok(order) = self.orders.load(failed.order_id).await {
                    if order.status() == OrderStatus::Cancelled {
                        self.orders.republish(failed.order_id, correlation_id).await?;
                    }
                }
                info!(order_id = %failed.order_id, error = %e, "compensation not applicable");
                (HandlerOutcome::Rejected(e.to_string()), Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let mut entry = ProcessedEvent::for_event(failed, Some(failed.order_id), Utc::now());
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        match self.ledger.record(entry).await {
            Ok(()) => Ok(outcome),
            Err(LedgerError::Duplicate(_)) => Ok(HandlerOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S, P, L> EventHandler for SalesSagaHandler<S, P, L>
where
    S: EventStore,
    P: EventPublisher,
    L: IdempotencyLedger,
{
    fn name(&self) -> &'static str {
        "sales-saga"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[StockReservationFailed::EVENT_TYPE]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
        if envelope.event_type() != StockReservationFailed::EVENT_TYPE {
            return Ok(HandlerOutcome::Ignored);
        }
        let failed: StockReservationFailed = envelope.decode()?;
        self.compensate(&failed).await.map_err(|e| {
            warn!(event_id = %failed.event_id(), error = %e, "compensation failed");
            HandlerError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tradeflow_core::{AggregateRoot, DomainError, EventId};
    use tradeflow_events::{
        EventMetadata, InMemoryEventBus, OrderCancelled, OrderConfirmed, PublishError,
    };

    use crate::event_store::InMemoryEventStore;
    use crate::idempotency::InMemoryLedger;

    type Service = OrderService<InMemoryEventStore, Arc<InMemoryEventBus>>;

    fn service() -> (Arc<Service>, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        (Arc::new(OrderService::new(InMemoryEventStore::new(), bus.clone())), bus)
    }

    fn clerk() -> Actor {
        Actor::system("test")
    }

    async fn confirmed_order(orders: &Service) -> Order {
        let order = orders.create_order(CustomerId::new(), clerk()).await.unwrap();
        let order_id = *order.id();
        orders
            .add_item(order_id, ProductId::new(), "Widget", 3, Money::usd(Decimal::new(1000, 2)), clerk())
            .await
            .unwrap();
        orders.confirm(order_id, clerk(), None).await.unwrap()
    }

    fn failure(order_id: OrderId) -> StockReservationFailed {
        StockReservationFailed {
            metadata: EventMetadata::new(Utc::now(), None),
            order_id,
            source_event_id: EventId::new(),
            reason: "insufficient stock".to_string(),
            shortages: vec![],
        }
    }

    #[tokio::test]
    async fn only_confirm_and_cancel_reach_the_bus() {
        let (orders, bus) = service();
        let order = confirmed_order(&orders).await;

        assert_eq!(order.status(), OrderStatus::Confirmed);
        assert_eq!(bus.published().len(), 1);

        let confirmed: OrderConfirmed = bus.published()[0].decode().unwrap();
        assert_eq!(confirmed.order_id, *order.id());
        assert_eq!(confirmed.previous_status, OrderStatus::Pending);
        assert_eq!(confirmed.lines[0].quantity, 3);
    }

    #[tokio::test]
    async fn republish_reuses_event_ids() {
        let (orders, bus) = service();
        let order = confirmed_order(&orders).await;
        orders.cancel(*order.id(), clerk(), None, None).await.unwrap();

        let sent = orders.republish(*order.id(), None).await.unwrap();
        assert_eq!(sent, 2);

        let ids: Vec<EventId> = bus.published().iter().map(|e| e.event_id()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], ids[2]);
        assert_eq!(ids[1], ids[3]);
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_committed_change() {
        let (orders, bus) = service();
        let order = orders.create_order(CustomerId::new(), clerk()).await.unwrap();
        let order_id = *order.id();
        orders
            .add_item(order_id, ProductId::new(), "Widget", 1, Money::usd(Decimal::ONE), clerk())
            .await
            .unwrap();

        bus.fail_next_publishes([PublishError::permanent("broker rejected")]);
        let err = orders.confirm(order_id, clerk(), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Publish(_)));

        assert_eq!(orders.load(order_id).await.unwrap().status(), OrderStatus::Confirmed);
        orders.republish(order_id, None).await.unwrap();
        assert_eq!(bus.published_of_type(OrderConfirmed::EVENT_TYPE).len(), 1);
    }

    #[tokio::test]
    async fn loading_an_unknown_order_is_not_found() {
        let (orders, _) = service();
        let err = orders.load(OrderId::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::NotFound)));
    }

    #[tokio::test]
    async fn reservation_failure_cancels_the_order_once() {
        let (orders, bus) = service();
        let order = confirmed_order(&orders).await;
        let handler = SalesSagaHandler::new(orders.clone(), InMemoryLedger::new());
        let envelope = EventEnvelope::wrap(&failure(*order.id())).unwrap();

        assert_eq!(handler.handle(&envelope).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(handler.handle(&envelope).await.unwrap(), HandlerOutcome::Duplicate);

        let cancelled = orders.load(*order.id()).await.unwrap();
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert_eq!(cancelled.updated_by(), Some(&Actor::system(SAGA_ACTOR)));

        let sent = bus.published_of_type(OrderCancelled::EVENT_TYPE);
        assert_eq!(sent.len(), 1);
        let event: OrderCancelled = sent[0].decode().unwrap();
        assert!(event.requires_compensation());
    }

    #[tokio::test]
    async fn failure_for_a_cancelled_order_is_rejected_not_retried() {
        let (orders, _) = service();
        let order = confirmed_order(&orders).await;
        orders.cancel(*order.id(), clerk(), None, None).await.unwrap();

        let handler = SalesSagaHandler::new(orders.clone(), InMemoryLedger::new());
        let envelope = EventEnvelope::wrap(&failure(*order.id())).unwrap();

        let outcome = handler.handle(&envelope).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn other_event_types_are_ignored() {
        let (orders, _) = service();
        let handler = SalesSagaHandler::new(orders, InMemoryLedger::new());
        let confirmed = OrderConfirmed {
            metadata: EventMetadata::new(Utc::now(), None),
            order_id: OrderId::new(),
            customer_id: CustomerId::new(),
            lines: vec![],
            total: Money::usd(Decimal::ZERO),
            previous_status: OrderStatus::Pending,
            confirmed_by: clerk(),
            order_created_at: Utc::now(),
        };
        let envelope = EventEnvelope::wrap(&confirmed).unwrap();
        assert_eq!(handler.handle(&envelope).await.unwrap(), HandlerOutcome::Ignored);
    }
}
