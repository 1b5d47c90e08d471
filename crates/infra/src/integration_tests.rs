//! End-to-end tests for the order/stock saga.
//!
//! Sales and Inventory run as separate services wired only through the event
//! bus: OrderService → bus → InventoryOrderHandler → bus → SalesSagaHandler.
//!
//! Verifies:
//! - Confirm debits stock, cancel of a confirmed order restores it
//! - Exhausted stock fails the reservation and Sales cancels the order
//! - Redelivered and out-of-order events are applied at most once
//! - Concurrent confirmations never oversell

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use tradeflow_core::{Actor, AggregateRoot, CustomerId, Money, OrderId, ProductId};
use tradeflow_events::{
    EventEnvelope, EventHandler, EventPublisher, HandlerOutcome, InMemoryEventBus,
    IntegrationEvent, OrderCancelled, OrderConfirmed, StockDebited, StockReleased,
    StockReservationFailed,
};
use tradeflow_inventory::{ProductStock, ReservationStatus};
use tradeflow_sales::OrderStatus;

use crate::event_store::InMemoryEventStore;
use crate::idempotency::InMemoryLedger;
use crate::inventory_store::{InMemoryInventoryStore, InventoryStore};
use crate::services::orders::SAGA_ACTOR;
use crate::services::{InventoryOrderHandler, InventoryService, OrderService, SalesSagaHandler};
use crate::workers::{ConsumerConfig, EventConsumer, WorkerHandle};

type Orders = OrderService<InMemoryEventStore, Arc<InMemoryEventBus>>;
type Inventory = InventoryService<InMemoryInventoryStore, Arc<InMemoryEventBus>>;

struct Saga {
    bus: Arc<InMemoryEventBus>,
    orders: Arc<Orders>,
    inventory: Arc<Inventory>,
    workers: Vec<WorkerHandle>,
}

impl Saga {
    /// Both services plus their consumers, sharing one bus.
    async fn start(stock: &[(ProductId, i64)], workers: usize) -> Self {
        let bus = Arc::new(InMemoryEventBus::new());
        let orders = Arc::new(OrderService::new(InMemoryEventStore::new(), bus.clone()));
        let inventory = Arc::new(InventoryService::new(
            InMemoryInventoryStore::with_products(
                stock.iter().map(|(id, qty)| ProductStock::new(*id, "Widget", *qty)),
            ),
            bus.clone(),
        ));

        let config = ConsumerConfig {
            workers,
            ..ConsumerConfig::default()
        };
        let inventory_consumer = EventConsumer::spawn(
            Arc::new(InventoryOrderHandler::new(inventory.clone())),
            &bus,
            config,
        )
        .await
        .unwrap();
        let sales_consumer = EventConsumer::spawn(
            Arc::new(SalesSagaHandler::new(orders.clone(), InMemoryLedger::new())),
            &bus,
            config,
        )
        .await
        .unwrap();

        Self {
            bus,
            orders,
            inventory,
            workers: vec![inventory_consumer, sales_consumer],
        }
    }

    /// Wait until both consumer groups have settled everything published.
    async fn settle(&self) {
        for _ in 0..500 {
            if self.bus.in_flight("inventory-orders") == 0 && self.bus.in_flight("sales-saga") == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("saga did not settle");
    }

    async fn stop(self) {
        for worker in self.workers {
            worker.shutdown().await;
        }
    }

    async fn on_hand(&self, product: ProductId) -> i64 {
        self.inventory.store().stock(product).await.unwrap().unwrap().on_hand
    }

    async fn place(&self, product: ProductId, quantity: i64) -> OrderId {
        let order = self.orders.create_order(CustomerId::new(), clerk()).await.unwrap();
        let order_id = *order.id();
        self.orders
            .add_item(order_id, product, "Widget", quantity, Money::usd(Decimal::new(1000, 2)), clerk())
            .await
            .unwrap();
        order_id
    }
}

fn clerk() -> Actor {
    Actor::system("clerk")
}

#[tokio::test]
async fn confirming_an_order_debits_its_stock() {
    let product = ProductId::new();
    let saga = Saga::start(&[(product, 10)], 4).await;

    let order_id = saga.place(product, 3).await;
    saga.orders.confirm(order_id, clerk(), None).await.unwrap();
    saga.settle().await;

    let rows = saga.inventory.store().reservations_for_order(order_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quantity, 3);
    assert_eq!(rows[0].status, ReservationStatus::Debited);
    assert_eq!(saga.on_hand(product).await, 7);

    let debited: StockDebited = saga.bus.published_of_type(StockDebited::EVENT_TYPE)[0]
        .decode()
        .unwrap();
    assert_eq!(debited.order_id, order_id);
    assert_eq!(saga.orders.load(order_id).await.unwrap().status(), OrderStatus::Confirmed);
    saga.stop().await;
}

#[tokio::test]
async fn cancelling_a_confirmed_order_restores_stock() {
    let product = ProductId::new();
    let saga = Saga::start(&[(product, 10)], 4).await;

    let order_id = saga.place(product, 3).await;
    saga.orders.confirm(order_id, clerk(), None).await.unwrap();
    saga.settle().await;
    saga.orders
        .cancel(order_id, clerk(), Some("changed mind".to_string()), None)
        .await
        .unwrap();
    saga.settle().await;

    let rows = saga.inventory.store().reservations_for_order(order_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ReservationStatus::Released);
    assert_eq!(saga.on_hand(product).await, 10);

    let released: StockReleased = saga.bus.published_of_type(StockReleased::EVENT_TYPE)[0]
        .decode()
        .unwrap();
    assert!(released.compensated);
    assert_eq!(released.lines[0].quantity, 3);
    saga.stop().await;
}

#[tokio::test]
async fn exhausted_stock_fails_the_second_order_and_sales_cancels_it() {
    let product = ProductId::new();
    let saga = Saga::start(&[(product, 10)], 4).await;

    let first = saga.place(product, 6).await;
    saga.orders.confirm(first, clerk(), None).await.unwrap();
    saga.settle().await;
    assert_eq!(saga.on_hand(product).await, 4);

    let second = saga.place(product, 6).await;
    saga.orders.confirm(second, clerk(), None).await.unwrap();
    saga.settle().await;

    assert_eq!(saga.on_hand(product).await, 4);
    let failed: StockReservationFailed = saga
        .bus
        .published_of_type(StockReservationFailed::EVENT_TYPE)[0]
        .decode()
        .unwrap();
    assert_eq!(failed.order_id, second);
    assert_eq!(failed.shortages[0].requested, 6);
    assert_eq!(failed.shortages[0].available, 4);

    let cancelled = saga.orders.load(second).await.unwrap();
    assert_eq!(cancelled.status(), OrderStatus::Cancelled);
    assert_eq!(cancelled.updated_by(), Some(&Actor::system(SAGA_ACTOR)));
    assert_eq!(saga.orders.load(first).await.unwrap().status(), OrderStatus::Confirmed);
    saga.stop().await;
}

#[tokio::test]
async fn duplicate_confirmation_is_applied_once() {
    let product = ProductId::new();
    let saga = Saga::start(&[(product, 10)], 4).await;

    let order_id = saga.place(product, 3).await;
    saga.orders.confirm(order_id, clerk(), None).await.unwrap();
    saga.settle().await;

    let confirmed = saga.bus.published_of_type(OrderConfirmed::EVENT_TYPE)[0].clone();
    saga.bus.publish_envelope(confirmed.clone()).await.unwrap();
    saga.bus.publish_envelope(confirmed).await.unwrap();
    saga.settle().await;

    let rows = saga.inventory.store().reservations_for_order(order_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(saga.on_hand(product).await, 7);
    assert_eq!(saga.inventory.store().ledger_len().await, 1);

    // Every redelivery republishes the same result event.
    let debits = saga.bus.published_of_type(StockDebited::EVENT_TYPE);
    assert_eq!(debits.len(), 3);
    assert!(debits.iter().all(|e| e.event_id() == debits[0].event_id()));
    saga.stop().await;
}

#[tokio::test]
async fn cancellation_overtaking_its_confirmation_reserves_nothing() {
    let product = ProductId::new();
    let bus = Arc::new(InMemoryEventBus::new());
    let orders = OrderService::new(InMemoryEventStore::new(), bus.clone());
    let inventory = Arc::new(InventoryService::new(
        InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 10)]),
        bus.clone(),
    ));
    let handler = InventoryOrderHandler::new(inventory.clone());

    let order = orders.create_order(CustomerId::new(), clerk()).await.unwrap();
    let order_id = *order.id();
    orders
        .add_item(order_id, product, "Widget", 3, Money::usd(Decimal::ONE), clerk())
        .await
        .unwrap();
    orders.confirm(order_id, clerk(), None).await.unwrap();
    orders.cancel(order_id, clerk(), None, None).await.unwrap();

    let confirmed = bus.published_of_type(OrderConfirmed::EVENT_TYPE)[0].clone();
    let cancelled = bus.published_of_type(OrderCancelled::EVENT_TYPE)[0].clone();

    assert_eq!(handler.handle(&cancelled).await.unwrap(), HandlerOutcome::Applied);
    let late = handler.handle(&confirmed).await.unwrap();
    assert!(matches!(late, HandlerOutcome::Rejected(_)));

    assert_eq!(inventory.store().stock(product).await.unwrap().unwrap().on_hand, 10);
    let rows = inventory.store().reservations_for_order(order_id).await.unwrap();
    assert!(rows.iter().all(|r| !r.holds_stock()));
    assert!(bus.published_of_type(StockDebited::EVENT_TYPE).is_empty());
    assert!(bus.published_of_type(StockReleased::EVENT_TYPE).is_empty());
}

#[tokio::test]
async fn undecodable_envelopes_are_dead_lettered() {
    let saga = Saga::start(&[], 1).await;

    let mut envelope = EventEnvelope::wrap(&StockDebited {
        metadata: tradeflow_events::EventMetadata::new(chrono::Utc::now(), None),
        order_id: OrderId::new(),
        source_event_id: tradeflow_core::EventId::new(),
        lines: vec![],
    })
    .unwrap();
    // Relabel as an order confirmation; the payload no longer matches.
    let mut json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
    json["event_type"] = serde_json::Value::from(OrderConfirmed::EVENT_TYPE);
    envelope = EventEnvelope::from_json(json.to_string().as_bytes()).unwrap();

    saga.bus.publish_envelope(envelope).await.unwrap();
    saga.settle().await;

    let dead = saga.bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].group, "inventory-orders");
    saga.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_never_oversell() {
    let product = ProductId::new();
    let saga = Arc::new(Saga::start(&[(product, 10)], 8).await);

    let mut placed = Vec::new();
    for _ in 0..20 {
        placed.push(saga.place(product, 1).await);
    }

    let mut confirms = tokio::task::JoinSet::new();
    for order_id in placed.clone() {
        let saga = saga.clone();
        confirms.spawn(async move { saga.orders.confirm(order_id, clerk(), None).await });
    }
    while let Some(joined) = confirms.join_next().await {
        joined.unwrap().unwrap();
    }
    saga.settle().await;

    assert_eq!(saga.on_hand(product).await, 0);
    assert_eq!(saga.bus.published_of_type(StockDebited::EVENT_TYPE).len(), 10);
    assert_eq!(saga.bus.published_of_type(StockReservationFailed::EVENT_TYPE).len(), 10);

    let mut confirmed = 0;
    let mut cancelled = 0;
    for order_id in placed {
        match saga.orders.load(order_id).await.unwrap().status() {
            OrderStatus::Confirmed => confirmed += 1,
            OrderStatus::Cancelled => cancelled += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!((confirmed, cancelled), (10, 10));

    let Ok(saga) = Arc::try_unwrap(saga) else {
        panic!("saga still shared");
    };
    saga.stop().await;
}
