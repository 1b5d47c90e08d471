//! Append-only event store boundary.
//!
//! Order streams are persisted here; the dispatcher rehydrates aggregates from
//! them and appends with optimistic concurrency.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
