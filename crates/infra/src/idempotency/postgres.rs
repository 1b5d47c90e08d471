//! `processed_events` table access.
//!
//! The free functions take any executor so the inventory store can insert the
//! ledger row inside its own transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::instrument;

use tradeflow_core::{CorrelationId, EventId, OrderId};
use tradeflow_events::{IdempotencyLedger, LedgerError, ProcessedEvent, ProcessingDecision};

use crate::db;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedger {
    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn try_begin_processing(
        &self,
        event_id: EventId,
    ) -> Result<ProcessingDecision, LedgerError> {
        Ok(match find(&self.pool, event_id).await? {
            Some(_) => ProcessingDecision::AlreadyProcessed,
            None => ProcessingDecision::ProceedAndRecord,
        })
    }

    #[instrument(skip(self, entry), fields(event_id = %entry.event_id), err)]
    async fn record(&self, entry: ProcessedEvent) -> Result<(), LedgerError> {
        insert(&self.pool, &entry).await
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, LedgerError> {
        find(&self.pool, event_id).await
    }
}

pub(crate) async fn insert<'e>(
    executor: impl PgExecutor<'e>,
    entry: &ProcessedEvent,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO processed_events (
            id,
            event_id,
            event_type,
            order_id,
            processed_at,
            correlation_id,
            detail
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.event_id.as_uuid())
    .bind(&entry.event_type)
    .bind(entry.order_id.map(|id| *id.as_uuid()))
    .bind(entry.processed_at)
    .bind(entry.correlation_id.as_ref().map(|c| c.as_str()))
    .bind(entry.detail.as_deref())
    .execute(executor)
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            LedgerError::Duplicate(entry.event_id)
        } else {
            LedgerError::Storage(e.to_string())
        }
    })?;
    Ok(())
}

pub(crate) async fn find<'e>(
    executor: impl PgExecutor<'e>,
    event_id: EventId,
) -> Result<Option<ProcessedEvent>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, event_id, event_type, order_id, processed_at, correlation_id, detail
        FROM processed_events
        WHERE event_id = $1
        "#,
    )
    .bind(event_id.as_uuid())
    .fetch_optional(executor)
    .await
    .map_err(|e| LedgerError::Storage(e.to_string()))?;

    row.map(|r| from_row(&r)).transpose()
}

fn from_row(row: &PgRow) -> Result<ProcessedEvent, LedgerError> {
    let storage = |e: sqlx::Error| LedgerError::Storage(format!("failed to read ledger row: {e}"));
    let correlation_id: Option<String> = row.try_get("correlation_id").map_err(storage)?;
    let order_id: Option<uuid::Uuid> = row.try_get("order_id").map_err(storage)?;
    let processed_at: DateTime<Utc> = row.try_get("processed_at").map_err(storage)?;
    let event_id: uuid::Uuid = row.try_get("event_id").map_err(storage)?;

    Ok(ProcessedEvent {
        id: row.try_get("id").map_err(storage)?,
        event_id: EventId::from_uuid(event_id),
        event_type: row.try_get("event_type").map_err(storage)?,
        order_id: order_id.map(OrderId::from_uuid),
        processed_at,
        correlation_id: correlation_id
            .map(CorrelationId::parse)
            .transpose()
            .map_err(|e| LedgerError::Storage(format!("corrupt correlation_id: {e}")))?,
        detail: row.try_get("detail").map_err(storage)?,
    })
}
