//! Infrastructure layer: persistence, transport, services and workers.
//!
//! - `event_store` / `command_dispatcher`: order streams and command execution
//! - `inventory_store`: transactional stock and reservation rows
//! - `idempotency`: processed-event ledgers
//! - `services`: Sales and Inventory application services and saga handlers
//! - `workers`: event consumers and the reservation sweeper
//! - `event_bus`: Redis Streams transport (feature `redis`)

pub mod command_dispatcher;
pub mod config;
pub mod db;
pub mod event_bus;
pub mod event_store;
pub mod idempotency;
pub mod inventory_store;
pub mod services;
pub mod workers;

#[cfg(test)]
mod integration_tests;
