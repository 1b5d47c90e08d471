//! Consumer-side handler contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{EnvelopeError, EventEnvelope};

/// What a handler did with a delivery. Every variant is acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Side effects were applied.
    Applied,
    /// The event id was already in the ledger; nothing was done.
    Duplicate,
    /// A business rule rejected the event (state or resource conflict). The
    /// rejection was recorded and, where relevant, reported back.
    Rejected(String),
    /// Not an event this handler acts on.
    Ignored,
}

/// Handler failures. Retryable ones are nacked, the rest dead-lettered.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload could not be interpreted (wrong type, newer version, corrupt).
    #[error("undecodable event: {0}")]
    Undecodable(#[from] EnvelopeError),

    /// Infrastructure hiccup; processing may succeed on redelivery.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unexpected condition that redelivery will not fix.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Processes one delivered envelope.
///
/// Implementations must tolerate duplicate and out-of-order delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Consumer group name.
    fn name(&self) -> &'static str;

    /// Event types this handler subscribes to.
    fn subscriptions(&self) -> &'static [&'static str];

    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(HandlerError::transient("db down").is_retryable());
        assert!(!HandlerError::fatal("constraint").is_retryable());
    }
}
