//! Mapping from order stream events to the integration events Inventory consumes.

use tradeflow_core::{AggregateRoot, CorrelationId, DomainResult, EventId};
use tradeflow_events::{
    EnvelopeError, EventEnvelope, EventMetadata, IntegrationEvent, OrderCancelled, OrderConfirmed,
    OrderStatus,
};

use crate::order::{Order, OrderEvent};

/// Integration events published by Sales.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SalesIntegrationEvent {
    Confirmed(OrderConfirmed),
    Cancelled(OrderCancelled),
}

impl SalesIntegrationEvent {
    /// Build the integration event for `event`, if it has one.
    ///
    /// `order` must already have `event` applied. The event id is derived from
    /// the order id and stream version, so rebuilding after a failed publish
    /// yields the same id.
    pub fn from_order_event(
        order: &Order,
        event: &OrderEvent,
        correlation_id: Option<CorrelationId>,
    ) -> DomainResult<Option<Self>> {
        let OrderEvent::OrderStatusChanged(changed) = event else {
            return Ok(None);
        };

        let event_type = match changed.to {
            OrderStatus::Confirmed => OrderConfirmed::EVENT_TYPE,
            OrderStatus::Cancelled => OrderCancelled::EVENT_TYPE,
            OrderStatus::Pending | OrderStatus::Fulfilled => return Ok(None),
        };
        let stream_event = EventId::from_uuid(*order.id().as_uuid());
        let metadata = EventMetadata::with_id(
            EventId::derived_from(stream_event, &format!("{event_type}@{}", order.version())),
            changed.occurred_at,
            correlation_id,
        );
        let snapshot = order.snapshot()?;

        Ok(Some(match changed.to {
            OrderStatus::Confirmed => Self::Confirmed(OrderConfirmed::from_snapshot(
                metadata,
                snapshot,
                changed.from,
                changed.actor.clone(),
            )),
            _ => Self::Cancelled(OrderCancelled::from_snapshot(
                metadata,
                snapshot,
                changed.from,
                changed.reason.clone(),
                changed.actor.clone(),
            )),
        }))
    }

    pub fn event_id(&self) -> EventId {
        match self {
            Self::Confirmed(e) => e.event_id(),
            Self::Cancelled(e) => e.event_id(),
        }
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        match self {
            Self::Confirmed(e) => EventEnvelope::wrap(e),
            Self::Cancelled(e) => EventEnvelope::wrap(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{AddItem, CancelOrder, ConfirmOrder, CreateOrder, OrderCommand};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tradeflow_core::{Actor, Aggregate, CustomerId, Money, OrderId, ProductId};

    fn order_with_item() -> Order {
        let order_id = OrderId::new();
        let mut order = Order::empty(order_id);
        let actor = Actor::system("test");
        order
            .execute(&OrderCommand::CreateOrder(CreateOrder {
                order_id,
                customer_id: CustomerId::new(),
                actor: actor.clone(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        order
            .execute(&OrderCommand::AddItem(AddItem {
                order_id,
                product_id: ProductId::new(),
                product_name: "Widget".to_string(),
                quantity: 3,
                unit_price: Money::usd(Decimal::new(1000, 2)),
                actor,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        order
    }

    fn confirm(order: &mut Order) -> Vec<OrderEvent> {
        let order_id = *order.id();
        order
            .execute(&OrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                actor: Actor::system("test"),
                occurred_at: Utc::now(),
            }))
            .unwrap()
    }

    #[test]
    fn item_events_have_no_integration_counterpart() {
        let order = order_with_item();
        let removed = OrderEvent::ItemRemoved(crate::order::ItemRemoved {
            order_id: *order.id(),
            product_id: ProductId::new(),
            actor: Actor::system("test"),
            occurred_at: Utc::now(),
        });
        assert!(
            SalesIntegrationEvent::from_order_event(&order, &removed, None)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn confirmation_carries_a_full_snapshot() {
        let mut order = order_with_item();
        let events = confirm(&mut order);

        let Some(SalesIntegrationEvent::Confirmed(event)) =
            SalesIntegrationEvent::from_order_event(&order, &events[0], None).unwrap()
        else {
            panic!("Expected OrderConfirmed");
        };
        assert_eq!(event.order_id, *order.id());
        assert_eq!(event.previous_status, OrderStatus::Pending);
        assert_eq!(event.lines.len(), 1);
        assert_eq!(event.total, Money::usd(Decimal::new(3000, 2)));
        assert_eq!(Some(event.order_created_at), order.created_at());
    }

    #[test]
    fn ids_are_stable_for_the_same_stream_position() {
        let mut order = order_with_item();
        let events = confirm(&mut order);

        let a = SalesIntegrationEvent::from_order_event(&order, &events[0], None)
            .unwrap()
            .unwrap();
        let b = SalesIntegrationEvent::from_order_event(&order, &events[0], None)
            .unwrap()
            .unwrap();
        assert_eq!(a.event_id(), b.event_id());
    }

    #[test]
    fn cancellation_after_confirmation_requires_compensation() {
        let mut order = order_with_item();
        confirm(&mut order);
        let order_id = *order.id();
        let events = order
            .execute(&OrderCommand::CancelOrder(CancelOrder {
                order_id,
                actor: Actor::system("test"),
                reason: Some("out of stock".to_string()),
                occurred_at: Utc::now(),
            }))
            .unwrap();

        let Some(SalesIntegrationEvent::Cancelled(event)) =
            SalesIntegrationEvent::from_order_event(&order, &events[0], None).unwrap()
        else {
            panic!("Expected OrderCancelled");
        };
        assert!(event.requires_compensation());
        assert_eq!(event.reason.as_deref(), Some("out of stock"));
        assert!(SalesIntegrationEvent::Cancelled(event).to_envelope().is_ok());
    }
}
