//! The integration event set exchanged between Sales and Inventory.
//!
//! Every event is a by-value snapshot: nothing here borrows from or points back
//! to a live aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{Actor, CustomerId, EventId, Money, OrderId, ProductId, ReservationId};

use crate::event::{EventMetadata, integration_event};

/// Order lifecycle status as seen on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Fulfilled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Fulfilled | OrderStatus::Cancelled)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineSnapshot {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_total: Money,
}

/// Materialized order state, copied out of the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub lines: Vec<OrderLineSnapshot>,
    pub total: Money,
    pub created_at: DateTime<Utc>,
}

/// Sales confirmed an order; Inventory must reserve and debit its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub lines: Vec<OrderLineSnapshot>,
    pub total: Money,
    pub previous_status: OrderStatus,
    pub confirmed_by: Actor,
    /// When the order itself was created (distinct from `occurred_at`).
    pub order_created_at: DateTime<Utc>,
}

integration_event!(OrderConfirmed, "sales.order.confirmed", 1);

impl OrderConfirmed {
    pub fn from_snapshot(
        metadata: EventMetadata,
        order: OrderSnapshot,
        previous_status: OrderStatus,
        confirmed_by: Actor,
    ) -> Self {
        Self {
            metadata,
            order_id: order.order_id,
            customer_id: order.customer_id,
            lines: order.lines,
            total: order.total,
            previous_status,
            confirmed_by,
            order_created_at: order.created_at,
        }
    }
}

/// Sales cancelled an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub lines: Vec<OrderLineSnapshot>,
    pub total: Money,
    pub previous_status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cancelled_by: Actor,
    pub order_created_at: DateTime<Utc>,
}

integration_event!(OrderCancelled, "sales.order.cancelled", 1);

impl OrderCancelled {
    pub fn from_snapshot(
        metadata: EventMetadata,
        order: OrderSnapshot,
        previous_status: OrderStatus,
        reason: Option<String>,
        cancelled_by: Actor,
    ) -> Self {
        Self {
            metadata,
            order_id: order.order_id,
            customer_id: order.customer_id,
            lines: order.lines,
            total: order.total,
            previous_status,
            reason,
            cancelled_by,
            order_created_at: order.created_at,
        }
    }

    /// A cancelled order that had been confirmed already had stock debited.
    pub fn requires_compensation(&self) -> bool {
        self.previous_status == OrderStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitedLine {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
}

/// Inventory debited stock for every line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDebited {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: OrderId,
    /// The `OrderConfirmed` this reacts to.
    pub source_event_id: EventId,
    pub lines: Vec<DebitedLine>,
}

integration_event!(StockDebited, "inventory.stock.debited", 1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: ProductId,
    pub requested: u32,
    pub available: i64,
}

/// Inventory could not reserve an order; nothing was debited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservationFailed {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: OrderId,
    pub source_event_id: EventId,
    pub reason: String,
    #[serde(default)]
    pub shortages: Vec<StockShortage>,
}

integration_event!(StockReservationFailed, "inventory.stock.reservation_failed", 1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedLine {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Inventory returned an order's stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: OrderId,
    pub source_event_id: EventId,
    pub lines: Vec<ReleasedLine>,
    /// True when debited stock was given back for a confirmed order.
    #[serde(default)]
    pub compensated: bool,
}

integration_event!(StockReleased, "inventory.stock.released", 1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, IntegrationEvent};
    use rust_decimal::Decimal;

    fn snapshot() -> OrderSnapshot {
        let price = Money::usd(Decimal::new(1000, 2));
        OrderSnapshot {
            order_id: OrderId::new(),
            customer_id: CustomerId::new(),
            status: OrderStatus::Confirmed,
            lines: vec![OrderLineSnapshot {
                product_id: ProductId::new(),
                product_name: "Widget".to_string(),
                quantity: 3,
                unit_price: price.clone(),
                line_total: price.times(3).unwrap(),
            }],
            total: price.times(3).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn events_copy_the_snapshot_by_value() {
        let mut order = snapshot();
        let event = OrderConfirmed::from_snapshot(
            EventMetadata::new(Utc::now(), None),
            order.clone(),
            OrderStatus::Pending,
            Actor::system("test"),
        );

        order.lines[0].quantity = 99;
        assert_eq!(event.lines[0].quantity, 3);
        assert_eq!(event.event_type(), OrderConfirmed::EVENT_TYPE);
    }

    #[test]
    fn only_confirmed_orders_need_compensation() {
        let cancel = |previous| {
            OrderCancelled::from_snapshot(
                EventMetadata::new(Utc::now(), None),
                snapshot(),
                previous,
                Some("customer request".to_string()),
                Actor::system("test"),
            )
        };
        assert!(cancel(OrderStatus::Confirmed).requires_compensation());
        assert!(!cancel(OrderStatus::Pending).requires_compensation());
    }

    #[test]
    fn metadata_is_flattened_into_the_payload() {
        let event = StockDebited {
            metadata: EventMetadata::new(Utc::now(), None),
            order_id: OrderId::new(),
            source_event_id: EventId::new(),
            lines: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_id"], serde_json::json!(event.metadata.event_id));
        assert_eq!(json["schema_version"], 1);
    }
}
