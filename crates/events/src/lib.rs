//! Integration events and the messaging port shared by Sales and Inventory.
//!
//! - `event` / `integration`: the immutable, versioned event set
//! - `envelope`: the wire format (type + version header over a JSON payload)
//! - `bus`: publisher/subscriber port with explicit ack/nack
//! - `retry`: bounded backoff for transient publish failures
//! - `idempotency`: the processed-event ledger contract

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod idempotency;
pub mod in_memory_bus;
pub mod integration;
pub mod retry;

pub use bus::{
    Acker, BatchFailure, BatchPublishReport, Delivery, DeliveryError, EventPublisher,
    EventPublisherExt, EventSubscriber, PublishError, Subscription,
};
pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::{Event, EventMetadata, IntegrationEvent};
pub use handler::{EventHandler, HandlerError, HandlerOutcome};
pub use idempotency::{IdempotencyLedger, LedgerError, ProcessedEvent, ProcessingDecision};
pub use in_memory_bus::{DeadLetter, InMemoryEventBus};
pub use integration::{
    DebitedLine, OrderCancelled, OrderConfirmed, OrderLineSnapshot, OrderSnapshot, OrderStatus,
    ReleasedLine, StockDebited, StockReleased, StockReservationFailed, StockShortage,
};
pub use retry::{BackoffStrategy, RetryPolicy, RetryingPublisher};
