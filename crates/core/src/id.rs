//! Strongly-typed identifiers used across the domain.
//!
//! Sales and Inventory reference each other's identifiers by value only; there
//! is no foreign-key coupling across the service boundary.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a user (actor identity).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of an event-sourced stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(Uuid);

/// Identifier of a sales order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

/// Identifier of a customer (owned by an external party service).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(Uuid);

/// Identifier of a sellable / stocked product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(Uuid);

/// Identifier of a stock reservation row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

/// Globally unique event identifier; the deduplication key on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// The nil UUID is never a valid identity.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Reject the nil identifier with a validation error.
            pub fn ensure_present(&self) -> Result<(), DomainError> {
                if self.is_nil() {
                    return Err(DomainError::validation(concat!($name, " cannot be empty")));
                }
                Ok(())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UserId, "UserId");
impl_uuid_newtype!(AggregateId, "AggregateId");
impl_uuid_newtype!(OrderId, "OrderId");
impl_uuid_newtype!(CustomerId, "CustomerId");
impl_uuid_newtype!(ProductId, "ProductId");
impl_uuid_newtype!(ReservationId, "ReservationId");
impl_uuid_newtype!(EventId, "EventId");

impl OrderId {
    /// The event stream that holds this order's history.
    pub fn stream_id(&self) -> AggregateId {
        AggregateId::from_uuid(self.0)
    }
}

/// Namespace for identifiers derived from other identifiers (UUIDv5).
const DERIVED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b4e_9a7d_4c3b_8e21_5d0a_7f3e_c914);

impl EventId {
    /// Deterministically derive the ID of an event caused by `source`.
    ///
    /// Re-deriving for the same `(source, discriminator)` always yields the same
    /// ID, so a result event republished after a redelivery is deduplicated by
    /// its consumers.
    pub fn derived_from(source: EventId, discriminator: &str) -> Self {
        let mut name = Vec::with_capacity(16 + discriminator.len());
        name.extend_from_slice(source.0.as_bytes());
        name.extend_from_slice(discriminator.as_bytes());
        Self(Uuid::new_v5(&DERIVED_ID_NAMESPACE, &name))
    }
}

/// Cross-service tracing identifier.
///
/// Correlation IDs frequently originate outside this system (HTTP request IDs,
/// upstream traces), so they are carried as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("correlation id cannot be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_ids_are_rejected() {
        let id = ProductId::from_uuid(Uuid::nil());
        assert!(id.is_nil());
        assert!(matches!(id.ensure_present(), Err(DomainError::Validation(_))));
        assert!(ProductId::new().ensure_present().is_ok());
    }

    #[test]
    fn parse_round_trips_through_display() {
        let id = OrderId::new();
        let parsed: OrderId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_uuid_is_invalid_id() {
        let err = "not-a-uuid".parse::<ReservationId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("ReservationId")));
    }

    #[test]
    fn derived_event_ids_are_deterministic() {
        let source = EventId::new();
        let a = EventId::derived_from(source, "inventory.stock.debited");
        let b = EventId::derived_from(source, "inventory.stock.debited");
        let c = EventId::derived_from(source, "inventory.stock.released");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, source);
    }

    #[test]
    fn blank_correlation_id_is_rejected() {
        assert!(CorrelationId::parse("  ").is_err());
        assert_eq!(CorrelationId::parse("req-42").unwrap().as_str(), "req-42");
    }
}
