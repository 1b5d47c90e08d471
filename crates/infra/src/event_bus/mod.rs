//! Transport-backed event bus implementations.
//!
//! The publisher/subscriber port and the in-memory bus live in
//! `tradeflow-events`. This module adds the Redis Streams transport used
//! between the Sales and Inventory processes.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsEventBus, RedisStreamsError};
