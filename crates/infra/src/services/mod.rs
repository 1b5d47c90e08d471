//! Application services and the event handlers that drive them.
//!
//! - `orders`: Sales side. Dispatches order commands against the event store
//!   and publishes `OrderConfirmed`/`OrderCancelled`; compensates orders whose
//!   stock could not be reserved.
//! - `inventory`: Inventory side. Turns order events into stock commands, runs
//!   them through an [`InventoryStore`](crate::inventory_store::InventoryStore)
//!   and publishes the result events.

pub mod inventory;
pub mod orders;

use thiserror::Error;

use tradeflow_core::{DomainError, ErrorKind};
use tradeflow_events::{EnvelopeError, HandlerError, LedgerError, PublishError};

use crate::command_dispatcher::DispatchError;
use crate::inventory_store::StoreError;

pub use inventory::{InventoryOrderHandler, InventoryService, SweepReport};
pub use orders::{OrderService, SalesSagaHandler};

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A business rule refused the operation.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Dispatch(DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The state change committed but its event did not reach the bus.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(e) => ServiceError::Domain(e),
            other => ServiceError::Dispatch(other),
        }
    }
}

impl ServiceError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            ServiceError::Domain(e) => Some(e),
            _ => None,
        }
    }

    /// Wrong lifecycle state or missing entity: retrying cannot help.
    pub fn is_conflict(&self) -> bool {
        self.domain().is_some_and(|e| {
            matches!(e.kind(), ErrorKind::StateConflict | ErrorKind::NotFound)
        })
    }

    /// Worth another attempt (redelivery, next sweep).
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Dispatch(e) => match e {
                DispatchError::Concurrency(_) => true,
                DispatchError::Store(store) => store.is_retryable(),
                _ => false,
            },
            ServiceError::Store(e) => e.is_transient(),
            ServiceError::Ledger(LedgerError::Storage(_)) => true,
            ServiceError::Publish(e) => e.is_transient(),
            ServiceError::Domain(_)
            | ServiceError::Ledger(LedgerError::Duplicate(_))
            | ServiceError::Envelope(_) => false,
        }
    }
}

impl From<ServiceError> for HandlerError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::Envelope(e) => HandlerError::Undecodable(e),
            e if e.is_transient() => HandlerError::Transient(e.to_string()),
            e => HandlerError::Fatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::EventStoreError;

    #[test]
    fn domain_errors_unwrap_from_dispatch() {
        let err = ServiceError::from(DispatchError::Domain(DomainError::not_found()));
        assert!(matches!(err, ServiceError::Domain(DomainError::NotFound)));
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }

    #[test]
    fn retryable_failures_become_transient_handler_errors() {
        let concurrency = ServiceError::from(DispatchError::Concurrency("stale".into()));
        assert!(HandlerError::from(concurrency).is_retryable());

        let unavailable = ServiceError::from(StoreError::Unavailable("pool timed out".into()));
        assert!(HandlerError::from(unavailable).is_retryable());

        let publish = ServiceError::from(PublishError::transient("broker down"));
        assert!(HandlerError::from(publish).is_retryable());

        let corrupt = ServiceError::from(DispatchError::Store(EventStoreError::InvalidAppend(
            "gap".into(),
        )));
        assert!(matches!(HandlerError::from(corrupt), HandlerError::Fatal(_)));
    }
}
