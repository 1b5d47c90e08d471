//! Processed-event ledger contract.
//!
//! The ledger answers one question before any side effect runs: has this event
//! id been applied already? Rows are written in the same transaction as the
//! side effect and never updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tradeflow_core::{CorrelationId, EventId, OrderId};

use crate::event::IntegrationEvent;

/// One applied (or deliberately rejected) event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: Uuid,
    /// Source event id; unique.
    pub event_id: EventId,
    pub event_type: String,
    pub order_id: Option<OrderId>,
    pub processed_at: DateTime<Utc>,
    pub correlation_id: Option<CorrelationId>,
    /// Reason a command was refused, where the refusal was reported back.
    pub detail: Option<String>,
}

impl ProcessedEvent {
    pub fn for_event<E: IntegrationEvent>(
        event: &E,
        order_id: Option<OrderId>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: event.event_id(),
            event_type: E::EVENT_TYPE.to_string(),
            order_id,
            processed_at,
            correlation_id: event.correlation_id().cloned(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessingDecision {
    /// Skip all side effects and report success.
    AlreadyProcessed,
    /// Apply the side effect and record the event in the same transaction.
    ProceedAndRecord,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The unique constraint on `event_id` fired: a concurrent consumer won.
    #[error("event {0} already recorded")]
    Duplicate(EventId),

    #[error("ledger storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn try_begin_processing(&self, event_id: EventId)
    -> Result<ProcessingDecision, LedgerError>;

    /// Insert a ledger row; fails with [`LedgerError::Duplicate`] if present.
    async fn record(&self, entry: ProcessedEvent) -> Result<(), LedgerError>;

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, LedgerError>;
}
