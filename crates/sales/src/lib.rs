//! Sales orders domain module (event-sourced).
//!
//! This crate contains business rules for orders, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage). Confirmation and
//! cancellation are published to Inventory as integration events.

pub mod integration;
pub mod item;
pub mod order;

pub use integration::SalesIntegrationEvent;
pub use item::OrderItem;
pub use order::{
    AddItem, CancelOrder, ConfirmOrder, CreateOrder, ItemAdded, ItemQuantityUpdated, ItemRemoved,
    MarkFulfilled, Order, OrderCommand, OrderCreated, OrderEvent, OrderStatusChanged, RemoveItem,
    UpdateItemQuantity,
};
pub use tradeflow_events::OrderStatus;
