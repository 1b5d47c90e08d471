//! `tradeflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the Sales and
//! Inventory services (no infrastructure concerns).

pub mod actor;
pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use actor::Actor;
pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{
    AggregateId, CorrelationId, CustomerId, EventId, OrderId, ProductId, ReservationId, UserId,
};
pub use money::Money;
pub use value_object::ValueObject;
