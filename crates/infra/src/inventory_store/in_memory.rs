use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use tradeflow_core::{EventId, OrderId, ProductId, ReservationId};
use tradeflow_events::{IdempotencyLedger, LedgerError, ProcessedEvent, ProcessingDecision};
use tradeflow_inventory::{ProductStock, StockBook, StockCommand, StockReservation};

use super::{InventoryStore, StoreError, StoreOutcome, rejection_entry, rejection_shortages};

#[derive(Debug, Default)]
struct State {
    book: StockBook,
    ledger: HashMap<EventId, ProcessedEvent>,
}

/// In-memory inventory for tests/dev.
///
/// One async mutex covers the stock book and the ledger, so every command and
/// its ledger row commit together.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    state: Mutex<State>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing stock.
    pub fn with_products(products: impl IntoIterator<Item = ProductStock>) -> Self {
        let mut book = StockBook::new();
        for product in products {
            book.insert_product(product);
        }
        Self {
            state: Mutex::new(State {
                book,
                ledger: HashMap::new(),
            }),
        }
    }

    /// A copy of the current stock book.
    pub async fn snapshot(&self) -> StockBook {
        self.state.lock().await.book.clone()
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryInventoryStore {
    async fn try_begin_processing(
        &self,
        event_id: EventId,
    ) -> Result<ProcessingDecision, LedgerError> {
        Ok(if self.state.lock().await.ledger.contains_key(&event_id) {
            ProcessingDecision::AlreadyProcessed
        } else {
            ProcessingDecision::ProceedAndRecord
        })
    }

    async fn record(&self, entry: ProcessedEvent) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.ledger.contains_key(&entry.event_id) {
            return Err(LedgerError::Duplicate(entry.event_id));
        }
        state.ledger.insert(entry.event_id, entry);
        Ok(())
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, LedgerError> {
        Ok(self.state.lock().await.ledger.get(&event_id).cloned())
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn process(
        &self,
        command: StockCommand,
        processed: Option<ProcessedEvent>,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(entry) = &processed {
            if state.ledger.contains_key(&entry.event_id) {
                debug!(event_id = %entry.event_id, "event already in ledger");
                return Ok(StoreOutcome::AlreadyProcessed);
            }
        }

        let outcome = match state.book.execute(command.clone(), now) {
            Ok(outcome) => {
                if let Some(entry) = processed {
                    state.ledger.insert(entry.event_id, entry);
                }
                StoreOutcome::Applied(outcome)
            }
            Err(error) => {
                let shortages = rejection_shortages(&state.book, &command, &error);
                if let Some(entry) = processed {
                    state
                        .ledger
                        .insert(entry.event_id, rejection_entry(entry, &error));
                }
                StoreOutcome::Rejected { error, shortages }
            }
        };
        Ok(outcome)
    }

    async fn stock(&self, product_id: ProductId) -> Result<Option<ProductStock>, StoreError> {
        Ok(self.state.lock().await.book.product(product_id).cloned())
    }

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(self.state.lock().await.book.reservation(reservation_id).cloned())
    }

    async fn reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<StockReservation>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .book
            .reservations_for_order(order_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<ReservationId>, StoreError> {
        Ok(self.state.lock().await.book.expired(now, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeflow_core::DomainError;
    use tradeflow_inventory::{ReservationLine, ReservationStatus};
    use uuid::Uuid;

    fn processed(event_id: EventId, order_id: OrderId) -> ProcessedEvent {
        ProcessedEvent {
            id: Uuid::now_v7(),
            event_id,
            event_type: "sales.order.confirmed".to_string(),
            order_id: Some(order_id),
            processed_at: Utc::now(),
            correlation_id: None,
            detail: None,
        }
    }

    fn reserve(order_id: OrderId, product_id: ProductId, quantity: u32) -> StockCommand {
        StockCommand::ReserveOrder {
            order_id,
            lines: vec![ReservationLine {
                product_id,
                product_name: "Widget".to_string(),
                quantity,
            }],
            correlation_id: None,
            confirm: true,
        }
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_skipped() {
        let product = ProductId::new();
        let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 10)]);
        let order = OrderId::new();
        let event_id = EventId::new();

        let first = store
            .process(reserve(order, product, 3), Some(processed(event_id, order)), Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, StoreOutcome::Applied(_)));

        let second = store
            .process(reserve(order, product, 3), Some(processed(event_id, order)), Utc::now())
            .await
            .unwrap();
        assert_eq!(second, StoreOutcome::AlreadyProcessed);
        assert_eq!(store.stock(product).await.unwrap().unwrap().on_hand, 7);
        assert_eq!(store.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn rejections_are_recorded_with_their_reason() {
        let product = ProductId::new();
        let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 2)]);
        let order = OrderId::new();
        let event_id = EventId::new();

        let outcome = store
            .process(reserve(order, product, 5), Some(processed(event_id, order)), Utc::now())
            .await
            .unwrap();

        let StoreOutcome::Rejected { error, shortages } = outcome else {
            panic!("Expected Rejected");
        };
        assert!(matches!(error, DomainError::InsufficientStock { .. }));
        assert_eq!(shortages.len(), 1);
        assert_eq!(shortages[0].available, 2);

        let entry = store.find(event_id).await.unwrap().unwrap();
        assert!(entry.detail.unwrap().contains("insufficient stock"));
        assert_eq!(store.stock(product).await.unwrap().unwrap().on_hand, 2);
        assert!(store.reservations_for_order(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_conflicts_are_recorded_without_a_reason() {
        let product = ProductId::new();
        let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 10)]);
        let order = OrderId::new();
        let StockCommand::ReserveOrder { lines, .. } = reserve(order, product, 3) else {
            unreachable!()
        };
        let release = StockCommand::ReleaseOrder {
            order_id: order,
            lines,
            correlation_id: None,
            compensate: false,
            reason: Some("cancelled".to_string()),
        };
        store.process(release, None, Utc::now()).await.unwrap();

        let event_id = EventId::new();
        let outcome = store
            .process(reserve(order, product, 3), Some(processed(event_id, order)), Utc::now())
            .await
            .unwrap();

        let StoreOutcome::Rejected { error, shortages } = outcome else {
            panic!("Expected Rejected");
        };
        assert!(matches!(error, DomainError::InvalidStateTransition { .. }));
        assert!(shortages.is_empty());

        let entry = store.find(event_id).await.unwrap().unwrap();
        assert_eq!(entry.detail, None);
        assert_eq!(store.stock(product).await.unwrap().unwrap().on_hand, 10);
    }

    #[tokio::test]
    async fn commands_without_ledger_rows_still_apply() {
        let product = ProductId::new();
        let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 4)]);
        let order = OrderId::new();

        store.process(reserve(order, product, 4), None, Utc::now()).await.unwrap();

        let reservations = store.reservations_for_order(order).await.unwrap();
        assert_eq!(reservations[0].status, ReservationStatus::Debited);
        assert_eq!(store.ledger_len().await, 0);
    }
}
