//! Postgres inventory store.
//!
//! Every command runs in one transaction:
//!
//! 1. ledger lookup for the triggering event (skip if present)
//! 2. `SELECT ... FOR UPDATE` on the order's (or the addressed) reservation rows
//! 3. `SELECT ... FOR UPDATE` on the product rows, in product id order
//! 4. run the reservation engine over the locked rows
//! 5. write changed rows and the ledger row, commit
//!
//! Locks are always taken reservations first, then products by id, so two
//! transactions never wait on each other in opposite orders. A concurrent
//! duplicate of the same event blocks on the ledger's unique index and then
//! reports [`StoreOutcome::AlreadyProcessed`].

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use tradeflow_core::{CorrelationId, EventId, OrderId, ProductId, ReservationId};
use tradeflow_events::{IdempotencyLedger, LedgerError, ProcessedEvent, ProcessingDecision};
use tradeflow_inventory::{
    ProductStock, ReservationStatus, StockBook, StockCommand, StockReservation,
};

use super::{InventoryStore, StoreError, StoreOutcome, rejection_entry, rejection_shortages};
use crate::db;
use crate::idempotency::postgres as ledger;

const RESERVATION_LINE_KEY: &str = "stock_reservations_order_id_product_id_key";

const RESERVATION_COLUMNS: &str = "id, order_id, product_id, product_name, quantity, status, \
     created_at, processed_at, correlation_id, release_reason";

#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

/// Locked rows plus which of them already existed.
struct Locked {
    book: StockBook,
    products: HashSet<ProductId>,
    reservations: HashSet<ReservationId>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_rows(
        tx: &mut Transaction<'_, Postgres>,
        command: &StockCommand,
    ) -> Result<Locked, StoreError> {
        let reservations = match command {
            StockCommand::ReserveOrder { order_id, .. }
            | StockCommand::ReleaseOrder { order_id, .. } => {
                let sql = format!(
                    "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
                     WHERE order_id = $1 ORDER BY product_id FOR UPDATE"
                );
                sqlx::query(&sql)
                    .bind(order_id.as_uuid())
                    .fetch_all(&mut **tx)
                    .await?
            }
            StockCommand::ConfirmReservation { reservation_id }
            | StockCommand::ReleaseReservation { reservation_id, .. } => {
                let sql = format!(
                    "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE id = $1 FOR UPDATE"
                );
                sqlx::query(&sql)
                    .bind(reservation_id.as_uuid())
                    .fetch_all(&mut **tx)
                    .await?
            }
            StockCommand::ReceiveStock { .. } => Vec::new(),
        };
        let reservations = reservations
            .iter()
            .map(reservation_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut product_ids: BTreeSet<ProductId> = command.product_ids().into_iter().collect();
        product_ids.extend(reservations.iter().map(|r| r.product_id));
        let ids: Vec<Uuid> = product_ids.iter().map(|id| *id.as_uuid()).collect();

        let products = sqlx::query(
            r#"
            SELECT product_id, name, on_hand, version
            FROM products
            WHERE product_id = ANY($1)
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(product_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let mut locked = Locked {
            book: StockBook::new(),
            products: products.iter().map(|p| p.product_id).collect(),
            reservations: reservations.iter().map(|r| r.id).collect(),
        };
        for product in products {
            locked.book.insert_product(product);
        }
        for reservation in reservations {
            locked.book.insert_reservation(reservation);
        }
        Ok(locked)
    }

    async fn write_product(
        tx: &mut Transaction<'_, Postgres>,
        product: &ProductStock,
        existed: bool,
    ) -> Result<(), StoreError> {
        let query = if existed {
            sqlx::query(
                r#"
                UPDATE products
                SET name = $2, on_hand = $3, version = $4, updated_at = NOW()
                WHERE product_id = $1
                "#,
            )
        } else {
            sqlx::query(
                r#"
                INSERT INTO products (product_id, name, on_hand, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
        };
        query
            .bind(product.product_id.as_uuid())
            .bind(&product.name)
            .bind(product.on_hand)
            .bind(product.version as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                // Someone else created the product first; retrying sees their row.
                if db::is_unique_violation(&e) {
                    StoreError::Unavailable(format!("concurrent insert of product {}", product.product_id))
                } else {
                    StoreError::from(e)
                }
            })?;
        Ok(())
    }

    async fn write_reservation(
        tx: &mut Transaction<'_, Postgres>,
        reservation: &StockReservation,
        existed: bool,
    ) -> Result<(), StoreError> {
        if existed {
            sqlx::query(
                r#"
                UPDATE stock_reservations
                SET status = $2, processed_at = $3, release_reason = $4
                WHERE id = $1
                "#,
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.status.as_str())
            .bind(reservation.processed_at)
            .bind(reservation.release_reason.as_deref())
            .execute(&mut **tx)
            .await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO stock_reservations (
                id, order_id, product_id, product_name, quantity, status,
                created_at, processed_at, correlation_id, release_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.product_id.as_uuid())
        .bind(&reservation.product_name)
        .bind(i64::from(reservation.quantity))
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.processed_at)
        .bind(reservation.correlation_id.as_ref().map(|c| c.as_str()))
        .bind(reservation.release_reason.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            // A concurrent command for the same order inserted the line first.
            if db::violates(&e, RESERVATION_LINE_KEY) {
                StoreError::Unavailable(format!(
                    "concurrent reservation for order {} product {}",
                    reservation.order_id, reservation.product_id
                ))
            } else {
                StoreError::from(e)
            }
        })?;
        Ok(())
    }

    async fn fetch_reservations<'e>(
        executor: impl PgExecutor<'e>,
        filter: &str,
        bind: Uuid,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE {filter} ORDER BY product_id");
        sqlx::query(&sql)
            .bind(bind)
            .fetch_all(executor)
            .await?
            .iter()
            .map(reservation_from_row)
            .collect()
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresInventoryStore {
    async fn try_begin_processing(
        &self,
        event_id: EventId,
    ) -> Result<ProcessingDecision, LedgerError> {
        Ok(match ledger::find(&self.pool, event_id).await? {
            Some(_) => ProcessingDecision::AlreadyProcessed,
            None => ProcessingDecision::ProceedAndRecord,
        })
    }

    async fn record(&self, entry: ProcessedEvent) -> Result<(), LedgerError> {
        ledger::insert(&self.pool, &entry).await
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, LedgerError> {
        ledger::find(&self.pool, event_id).await
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(
        skip(self, command, processed),
        fields(
            command = command.name(),
            event_id = processed.as_ref().map(|p| p.event_id.to_string()),
            outcome
        ),
        err
    )]
    async fn process(
        &self,
        command: StockCommand,
        processed: Option<ProcessedEvent>,
        now: DateTime<Utc>,
    ) -> Result<StoreOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(entry) = &processed {
            if ledger::find(&mut *tx, entry.event_id).await?.is_some() {
                Span::current().record("outcome", "already_processed");
                return Ok(StoreOutcome::AlreadyProcessed);
            }
        }

        let mut locked = Self::lock_rows(&mut tx, &command).await?;

        let outcome = match locked.book.execute(command.clone(), now) {
            Ok(outcome) => {
                for product in &outcome.changed_products {
                    let existed = locked.products.contains(&product.product_id);
                    Self::write_product(&mut tx, product, existed).await?;
                }
                for reservation in &outcome.changed_reservations {
                    let existed = locked.reservations.contains(&reservation.id);
                    Self::write_reservation(&mut tx, reservation, existed).await?;
                }
                StoreOutcome::Applied(outcome)
            }
            Err(error) => {
                let shortages = rejection_shortages(&locked.book, &command, &error);
                StoreOutcome::Rejected { error, shortages }
            }
        };

        if let Some(entry) = processed {
            let entry = match &outcome {
                StoreOutcome::Rejected { error, .. } => rejection_entry(entry, error),
                _ => entry,
            };
            match ledger::insert(&mut *tx, &entry).await {
                Ok(()) => {}
                Err(LedgerError::Duplicate(event_id)) => {
                    // Lost the race to a concurrent delivery; dropping `tx` rolls back.
                    debug!(%event_id, "concurrent duplicate, rolling back");
                    Span::current().record("outcome", "already_processed");
                    return Ok(StoreOutcome::AlreadyProcessed);
                }
                Err(other) => return Err(other.into()),
            }
        }

        tx.commit().await?;
        Span::current().record(
            "outcome",
            match &outcome {
                StoreOutcome::Applied(_) => "applied",
                StoreOutcome::Rejected { .. } => "rejected",
                StoreOutcome::AlreadyProcessed => "already_processed",
            },
        );
        Ok(outcome)
    }

    async fn stock(&self, product_id: ProductId) -> Result<Option<ProductStock>, StoreError> {
        sqlx::query("SELECT product_id, name, on_hand, version FROM products WHERE product_id = $1")
            .bind(product_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(product_from_row)
            .transpose()
    }

    async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(
            Self::fetch_reservations(&self.pool, "id = $1", *reservation_id.as_uuid())
                .await?
                .into_iter()
                .next(),
        )
    }

    async fn reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> Result<Vec<StockReservation>, StoreError> {
        Self::fetch_reservations(&self.pool, "order_id = $1", *order_id.as_uuid()).await
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM stock_reservations
            WHERE status = 'Reserved' AND created_at <= $1
            ORDER BY created_at
            "#,
        )
        .bind(now - ttl)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(ReservationId::from_uuid)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn product_from_row(row: &PgRow) -> Result<ProductStock, StoreError> {
    let product_id: Uuid = row.try_get("product_id").map_err(corrupt)?;
    let version: i64 = row.try_get("version").map_err(corrupt)?;
    Ok(ProductStock {
        product_id: ProductId::from_uuid(product_id),
        name: row.try_get("name").map_err(corrupt)?,
        on_hand: row.try_get("on_hand").map_err(corrupt)?,
        version: u64::try_from(version).map_err(corrupt)?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<StockReservation, StoreError> {
    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let order_id: Uuid = row.try_get("order_id").map_err(corrupt)?;
    let product_id: Uuid = row.try_get("product_id").map_err(corrupt)?;
    let quantity: i64 = row.try_get("quantity").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let correlation_id: Option<String> = row.try_get("correlation_id").map_err(corrupt)?;

    Ok(StockReservation {
        id: ReservationId::from_uuid(id),
        order_id: OrderId::from_uuid(order_id),
        product_id: ProductId::from_uuid(product_id),
        product_name: row.try_get("product_name").map_err(corrupt)?,
        quantity: u32::try_from(quantity).map_err(corrupt)?,
        status: status.parse::<ReservationStatus>().map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        processed_at: row.try_get("processed_at").map_err(corrupt)?,
        correlation_id: correlation_id
            .map(CorrelationId::parse)
            .transpose()
            .map_err(corrupt)?,
        release_reason: row.try_get("release_reason").map_err(corrupt)?,
    })
}
