//! Inventory application service.
//!
//! Order events become stock commands; each command runs in one store
//! transaction together with the ledger row for its triggering event. Result
//! events reuse ids derived from the triggering event, so a redelivered order
//! event republishes the same result event instead of a new one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use tradeflow_core::{CorrelationId, DomainError, OrderId, ProductId, ReservationId};
use tradeflow_events::{
    DebitedLine, EventEnvelope, EventHandler, EventMetadata, EventPublisher, EventPublisherExt,
    HandlerError, HandlerOutcome, IntegrationEvent, OrderCancelled, OrderConfirmed,
    OrderLineSnapshot, ProcessedEvent, ReleasedLine, StockDebited, StockReleased,
    StockReservationFailed, StockShortage,
};
use tradeflow_inventory::{
    ProductStock, ReservationLine, ReservationStatus, Shortage, StockCommand, StockReservation,
};

use super::ServiceError;
use crate::inventory_store::{InventoryStore, StoreOutcome};

/// Release reason recorded by the expiry sweep.
pub const RESERVATION_EXPIRED: &str = "reservation expired";

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub released: usize,
    /// Confirmed or released by someone else between listing and releasing.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct InventoryService<St, P> {
    store: St,
    publisher: P,
}

impl<St: InventoryStore, P: EventPublisher> InventoryService<St, P> {
    pub fn new(store: St, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Hold stock for an order without debiting it for good. Unconfirmed holds
    /// are released by the expiry sweep.
    #[instrument(skip_all, fields(order_id = %order_id), err)]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        lines: Vec<ReservationLine>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Vec<StockReservation>, ServiceError> {
        let command = StockCommand::ReserveOrder {
            order_id,
            lines,
            correlation_id,
            confirm: false,
        };
        Ok(self.run(command).await?.reservations)
    }

    #[instrument(skip_all, fields(reservation_id = %reservation_id), err)]
    pub async fn confirm(&self, reservation_id: ReservationId) -> Result<StockReservation, ServiceError> {
        let outcome = self
            .run(StockCommand::ConfirmReservation { reservation_id })
            .await?;
        addressed(outcome.reservations)
    }

    #[instrument(skip_all, fields(reservation_id = %reservation_id), err)]
    pub async fn release(
        &self,
        reservation_id: ReservationId,
        reason: impl Into<String>,
    ) -> Result<StockReservation, ServiceError> {
        let outcome = self
            .run(StockCommand::ReleaseReservation {
                reservation_id,
                reason: reason.into(),
            })
            .await?;
        addressed(outcome.reservations)
    }

    #[instrument(skip_all, fields(product_id = %product_id, quantity = quantity), err)]
    pub async fn receive_stock(
        &self,
        product_id: ProductId,
        product_name: impl Into<String>,
        quantity: u32,
    ) -> Result<ProductStock, ServiceError> {
        let outcome = self
            .run(StockCommand::ReceiveStock {
                product_id,
                product_name: product_name.into(),
                quantity,
            })
            .await?;
        outcome
            .changed_products
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::invariant("stock receipt changed no product").into())
    }

    /// Release every `Reserved` row created at least `ttl` before `now`.
    ///
    /// Each release goes through the same transactional path as event-driven
    /// release; a row confirmed in the meantime is rejected by the state
    /// machine and counted as skipped.
    #[instrument(skip(self), fields(ttl_secs = ttl.num_seconds()), err)]
    pub async fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> Result<SweepReport, ServiceError> {
        let expired = self.store.expired_reservations(now, ttl).await?;
        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };

        for reservation_id in expired {
            let command = StockCommand::ReleaseReservation {
                reservation_id,
                reason: RESERVATION_EXPIRED.to_string(),
            };
            match self.store.process(command, None, now).await {
                Ok(StoreOutcome::Applied(outcome)) if !outcome.is_noop() => report.released += 1,
                Ok(StoreOutcome::Applied(_)) | Ok(StoreOutcome::AlreadyProcessed) => {
                    report.skipped += 1
                }
                Ok(StoreOutcome::Rejected { error, .. }) => {
                    debug!(%reservation_id, %error, "expired reservation moved on before release");
                    report.skipped += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(%reservation_id, error = %e, "release failed, will retry next sweep");
                    report.failed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.expired > 0 {
            info!(
                expired = report.expired,
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "reservation sweep finished"
            );
        }
        Ok(report)
    }

    /// Reserve and debit every line of a confirmed order.
    ///
    /// Publishes `StockDebited` on success and `StockReservationFailed` when
    /// stock ran out.
    #[instrument(skip_all, fields(event_id = %event.event_id(), order_id = %event.order_id), err)]
    pub async fn on_order_confirmed(
        &self,
        event: &OrderConfirmed,
    ) -> Result<HandlerOutcome, ServiceError> {
        let now = Utc::now();
        let command = StockCommand::ReserveOrder {
            order_id: event.order_id,
            lines: reservation_lines(&event.lines),
            correlation_id: event.correlation_id().cloned(),
            confirm: true,
        };
        let processed = ProcessedEvent::for_event(event, Some(event.order_id), now);

        match self.store.process(command, Some(processed), now).await? {
            StoreOutcome::Applied(outcome) => {
                info!(reservations = outcome.reservations.len(), "order stock debited");
                self.publisher
                    .publish(&debited(event, &outcome.reservations, now))
                    .await?;
                Ok(HandlerOutcome::Applied)
            }
            StoreOutcome::Rejected { error, shortages } => {
                info!(%error, "order stock not reserved");
                if matches!(error, DomainError::InsufficientStock { .. }) {
                    self.publisher
                        .publish(&reservation_failed(event, error.to_string(), &shortages, now))
                        .await?;
                }
                Ok(HandlerOutcome::Rejected(error.to_string()))
            }
            StoreOutcome::AlreadyProcessed => {
                debug!("duplicate OrderConfirmed, republishing result");
                self.republish_confirmation(event, now).await?;
                Ok(HandlerOutcome::Duplicate)
            }
        }
    }

    /// Release a cancelled order's stock, compensating debits when the order
    /// had been confirmed.
    #[instrument(skip_all, fields(event_id = %event.event_id(), order_id = %event.order_id), err)]
    pub async fn on_order_cancelled(
        &self,
        event: &OrderCancelled,
    ) -> Result<HandlerOutcome, ServiceError> {
        let now = Utc::now();
        let compensate = event.requires_compensation();
        let command = StockCommand::ReleaseOrder {
            order_id: event.order_id,
            lines: reservation_lines(&event.lines),
            correlation_id: event.correlation_id().cloned(),
            compensate,
            reason: event.reason.clone(),
        };
        let processed = ProcessedEvent::for_event(event, Some(event.order_id), now);

        match self.store.process(command, Some(processed), now).await? {
            StoreOutcome::Applied(outcome) => {
                if !outcome.released.is_empty() {
                    info!(released = outcome.released.len(), compensate, "order stock released");
                    self.publisher
                        .publish(&released(event, &outcome.released, compensate, now))
                        .await?;
                }
                Ok(HandlerOutcome::Applied)
            }
            StoreOutcome::Rejected { error, .. } => {
                info!(%error, "order stock not released");
                Ok(HandlerOutcome::Rejected(error.to_string()))
            }
            StoreOutcome::AlreadyProcessed => {
                debug!("duplicate OrderCancelled, republishing result");
                let lines: Vec<StockReservation> = self
                    .store
                    .reservations_for_order(event.order_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.status == ReservationStatus::Released && !r.is_tombstone())
                    .collect();
                if !lines.is_empty() {
                    self.publisher
                        .publish(&released(event, &lines, compensate, now))
                        .await?;
                }
                Ok(HandlerOutcome::Duplicate)
            }
        }
    }

    /// Rebuild the result of an `OrderConfirmed` that was processed before.
    async fn republish_confirmation(
        &self,
        event: &OrderConfirmed,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let reservations = self.store.reservations_for_order(event.order_id).await?;
        let debited_lines: Vec<StockReservation> = reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Debited)
            .cloned()
            .collect();
        if !debited_lines.is_empty() {
            self.publisher
                .publish(&debited(event, &debited_lines, now))
                .await?;
            return Ok(());
        }

        // Only a shortage rejection leaves a detail; other rejections published nothing.
        let shortage_reason = self
            .store
            .find(event.event_id())
            .await?
            .and_then(|entry| entry.detail);
        let holds_stock = reservations.iter().any(StockReservation::holds_stock);
        if let (Some(reason), false) = (shortage_reason, holds_stock) {
            let mut shortages = Vec::new();
            for line in reservation_lines(&event.lines) {
                let available = self
                    .store
                    .stock(line.product_id)
                    .await?
                    .map(|p| p.on_hand)
                    .unwrap_or(0);
                if i64::from(line.quantity) > available {
                    shortages.push(Shortage {
                        product_id: line.product_id,
                        requested: line.quantity,
                        available,
                    });
                }
            }
            self.publisher
                .publish(&reservation_failed(event, reason, &shortages, now))
                .await?;
        }
        Ok(())
    }

    async fn run(&self, command: StockCommand) -> Result<tradeflow_inventory::StockOutcome, ServiceError> {
        match self.store.process(command, None, Utc::now()).await? {
            StoreOutcome::Applied(outcome) => Ok(outcome),
            StoreOutcome::Rejected { error, .. } => Err(error.into()),
            StoreOutcome::AlreadyProcessed => Err(DomainError::invariant(
                "command without a ledger entry reported as already processed",
            )
            .into()),
        }
    }
}

fn addressed(reservations: Vec<StockReservation>) -> Result<StockReservation, ServiceError> {
    reservations
        .into_iter()
        .next()
        .ok_or_else(|| DomainError::not_found().into())
}

fn reservation_lines(lines: &[OrderLineSnapshot]) -> Vec<ReservationLine> {
    lines
        .iter()
        .map(|l| ReservationLine {
            product_id: l.product_id,
            product_name: l.product_name.clone(),
            quantity: l.quantity,
        })
        .collect()
}

fn debited(event: &OrderConfirmed, reservations: &[StockReservation], now: DateTime<Utc>) -> StockDebited {
    StockDebited {
        metadata: EventMetadata::caused_by(event.metadata(), StockDebited::EVENT_TYPE, now),
        order_id: event.order_id,
        source_event_id: event.event_id(),
        lines: reservations
            .iter()
            .map(|r| DebitedLine {
                reservation_id: r.id,
                product_id: r.product_id,
                product_name: r.product_name.clone(),
                quantity: r.quantity,
            })
            .collect(),
    }
}

fn reservation_failed(
    event: &OrderConfirmed,
    reason: String,
    shortages: &[Shortage],
    now: DateTime<Utc>,
) -> StockReservationFailed {
    StockReservationFailed {
        metadata: EventMetadata::caused_by(event.metadata(), StockReservationFailed::EVENT_TYPE, now),
        order_id: event.order_id,
        source_event_id: event.event_id(),
        reason,
        shortages: shortages
            .iter()
            .map(|s| StockShortage {
                product_id: s.product_id,
                requested: s.requested,
                available: s.available,
            })
            .collect(),
    }
}

fn released(
    event: &OrderCancelled,
    reservations: &[StockReservation],
    compensated: bool,
    now: DateTime<Utc>,
) -> StockReleased {
    StockReleased {
        metadata: EventMetadata::caused_by(event.metadata(), StockReleased::EVENT_TYPE, now),
        order_id: event.order_id,
        source_event_id: event.event_id(),
        lines: reservations
            .iter()
            .map(|r| ReleasedLine {
                reservation_id: r.id,
                product_id: r.product_id,
                quantity: r.quantity,
            })
            .collect(),
        compensated,
    }
}

/// Inventory's subscriber for order lifecycle events.
pub struct InventoryOrderHandler<St, P> {
    service: Arc<InventoryService<St, P>>,
}

impl<St, P> InventoryOrderHandler<St, P> {
    pub fn new(service: Arc<InventoryService<St, P>>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<St, P> EventHandler for InventoryOrderHandler<St, P>
where
    St: InventoryStore,
    P: EventPublisher,
{
    fn name(&self) -> &'static str {
        "inventory-orders"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[OrderConfirmed::EVENT_TYPE, OrderCancelled::EVENT_TYPE]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
        let event_type = envelope.event_type();
        let result = if event_type == OrderConfirmed::EVENT_TYPE {
            let event: OrderConfirmed = envelope.decode()?;
            self.service.on_order_confirmed(&event).await
        } else if event_type == OrderCancelled::EVENT_TYPE {
            let event: OrderCancelled = envelope.decode()?;
            self.service.on_order_cancelled(&event).await
        } else {
            return Ok(HandlerOutcome::Ignored);
        };
        result.map_err(|e| {
            warn!(event_id = %envelope.event_id(), error = %e, "inventory handler failed");
            HandlerError::from(e)
        })
    }
}
