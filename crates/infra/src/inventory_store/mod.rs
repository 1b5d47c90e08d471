//! Transactional inventory persistence.
//!
//! A store runs one [`StockCommand`] against the affected stock and reservation
//! rows and writes the ledger row for the triggering event in the same
//! transaction. Per-product mutations are serialized by the store (row locks in
//! Postgres, a single lock in memory), never by callers.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use tradeflow_core::{DomainError, OrderId, ProductId, ReservationId};
use tradeflow_events::{IdempotencyLedger, LedgerError, ProcessedEvent};
use tradeflow_inventory::{ProductStock, Shortage, StockCommand, StockOutcome, StockReservation};

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;

/// What a [`InventoryStore::process`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Changes committed (and the ledger row, if one was given).
    Applied(StockOutcome),
    /// The engine refused the command. No stock changed; the ledger row, if
    /// one was given, was recorded (with the reason for a stock shortage).
    Rejected {
        error: DomainError,
        /// Every uncovered line, for reserve commands that ran out of stock.
        shortages: Vec<Shortage>,
    },
    /// The ledger already holds the triggering event; nothing was done.
    AlreadyProcessed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Connectivity, lock timeouts, serialization failures.
    #[error("inventory storage unavailable: {0}")]
    Unavailable(String),

    /// Rows that do not map back onto domain values.
    #[error("corrupt inventory row: {0}")]
    Corrupt(String),

    #[error("inventory storage error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if crate::db::is_transient(&err) {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Database(err.to_string())
        }
    }
}

/// Inventory persistence. The store doubles as Inventory's idempotency ledger
/// so the ledger row and the stock change share one transaction.
#[async_trait]
pub trait InventoryStore: IdempotencyLedger {
    /// Execute `command` atomically, recording `processed` with it.
    ///
    /// If `processed.event_id` is already in the ledger the command is skipped
    /// and [`StoreOutcome::AlreadyProcessed`] is returned; a concurrent
    /// duplicate losing the unique-constraint race reports the same.
    async fn process(
        &self,
        command: StockCommand,
        processed: Option<ProcessedEvent>,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome, StoreError>;

    async fn stock(&self, product_id: ProductId) -> Result<Option<ProductStock>, StoreError>;

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockReservation>, StoreError>;

    async fn reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<StockReservation>, StoreError>;

    /// `Reserved` rows created at least `ttl` before `now`.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<ReservationId>, StoreError>;
}

/// Full shortage list for a rejected reserve, so the failure event names every
/// product that ran out and not just the first.
pub(crate) fn rejection_shortages(
    book: &tradeflow_inventory::StockBook,
    command: &StockCommand,
    error: &DomainError,
) -> Vec<Shortage> {
    match (command, error) {
        (
            StockCommand::ReserveOrder {
                order_id, lines, ..
            },
            DomainError::InsufficientStock { .. },
        ) => book.shortages(*order_id, lines),
        _ => Vec::new(),
    }
}

/// Ledger row for a rejected command. Only a stock shortage leaves a detail:
/// it is the reason a redelivered confirmation republishes as its failure.
pub(crate) fn rejection_entry(entry: ProcessedEvent, error: &DomainError) -> ProcessedEvent {
    match error {
        DomainError::InsufficientStock { .. } => entry.with_detail(error.to_string()),
        _ => entry,
    }
}
