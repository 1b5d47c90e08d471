//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// lifecycle conflicts, stock shortages). Infrastructure concerns belong elsewhere.
/// None of these are worth retrying: replaying the same input against the same
/// state produces the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. negative quantity, empty identifier).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An aggregate is no longer in a state that accepts this mutation.
    #[error("modification not allowed: {0}")]
    ModificationNotAllowed(String),

    /// A lifecycle transition was attempted from the wrong state.
    #[error("invalid state transition for {entity}: cannot {action} from {from}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    /// Not enough on-hand stock to satisfy a reservation.
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: String,
        requested: u32,
        available: i64,
    },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / duplicate creation).
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Coarse classification used by handlers to decide how to surface a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input; rejected synchronously.
    Validation,
    /// Wrong lifecycle state; reported as a structured result.
    StateConflict,
    /// Not enough of a shared resource; surfaced so the caller can compensate.
    ResourceConflict,
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn modification_not_allowed(msg: impl Into<String>) -> Self {
        Self::ModificationNotAllowed(msg.into())
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl core::fmt::Debug,
        action: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: format!("{from:?}"),
            action,
        }
    }

    pub fn insufficient_stock(
        product_id: impl core::fmt::Display,
        requested: u32,
        available: i64,
    ) -> Self {
        Self::InsufficientStock {
            product_id: product_id.to_string(),
            requested,
            available,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) => ErrorKind::Validation,
            DomainError::ModificationNotAllowed(_)
            | DomainError::InvalidStateTransition { .. }
            | DomainError::InvariantViolation(_)
            | DomainError::Conflict(_) => ErrorKind::StateConflict,
            DomainError::InsufficientStock { .. } => ErrorKind::ResourceConflict,
            DomainError::NotFound => ErrorKind::NotFound,
        }
    }
}
