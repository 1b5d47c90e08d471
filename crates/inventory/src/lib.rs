//! Inventory domain module.
//!
//! Stock levels and per-(order, product) reservations, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage). Stores load the
//! affected rows into a [`StockBook`], execute one [`StockCommand`] and persist
//! the rows named in the returned [`StockOutcome`] atomically.

pub mod book;
pub mod reservation;
pub mod stock;

pub use book::{ReservationLine, Shortage, StockBook, StockCommand, StockOutcome};
pub use reservation::{ReservationStatus, StockReservation, Transition};
pub use stock::ProductStock;
