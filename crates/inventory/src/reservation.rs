use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{
    CorrelationId, DomainError, DomainResult, OrderId, ProductId, ReservationId,
};

/// Reservation lifecycle.
///
/// ```text
/// (none) --reserve--> Reserved --confirm--> Debited   [terminal]
///                     Reserved --release--> Released  [terminal]
/// ```
///
/// Compensation of a cancelled, already-confirmed order additionally moves
/// `Debited -> Released`; nothing ever returns to `Reserved`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    Debited,
    Released,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "Reserved",
            ReservationStatus::Debited => "Debited",
            ReservationStatus::Released => "Released",
        }
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Reserved" => Ok(Self::Reserved),
            "Debited" => Ok(Self::Debited),
            "Released" => Ok(Self::Released),
            other => Err(DomainError::validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

/// Result of a transition request that did not fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Already in the requested state; nothing changed.
    AlreadyInState,
}

/// Stock held for one product of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the reservation reached a terminal state.
    pub processed_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<CorrelationId>,
    pub release_reason: Option<String>,
}

impl StockReservation {
    pub fn new_reserved(
        order_id: OrderId,
        product_id: ProductId,
        product_name: impl Into<String>,
        quantity: u32,
        correlation_id: Option<CorrelationId>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity == 0 {
            return Err(DomainError::validation("reservation quantity must be positive"));
        }
        Ok(Self {
            id: ReservationId::new(),
            order_id,
            product_id,
            product_name: product_name.into(),
            quantity,
            status: ReservationStatus::Reserved,
            created_at: now,
            processed_at: None,
            correlation_id,
            release_reason: None,
        })
    }

    /// A `Released` marker for a line that was cancelled before it was ever
    /// reserved. It holds no stock; it only makes a late reserve fail.
    pub fn tombstone(
        order_id: OrderId,
        product_id: ProductId,
        product_name: impl Into<String>,
        quantity: u32,
        correlation_id: Option<CorrelationId>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            order_id,
            product_id,
            product_name: product_name.into(),
            quantity,
            status: ReservationStatus::Released,
            created_at: now,
            processed_at: Some(now),
            correlation_id,
            release_reason: Some(reason.into()),
        }
    }

    /// Whether this reservation currently accounts for debited stock.
    pub fn holds_stock(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Reserved | ReservationStatus::Debited
        )
    }

    /// Released without ever having held stock.
    pub fn is_tombstone(&self) -> bool {
        self.status == ReservationStatus::Released && self.processed_at == Some(self.created_at)
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_active() && self.created_at + ttl <= now
    }

    /// `Reserved -> Debited`.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.status {
            ReservationStatus::Reserved => {
                self.status = ReservationStatus::Debited;
                self.processed_at = Some(now);
                Ok(Transition::Applied)
            }
            ReservationStatus::Debited => Ok(Transition::AlreadyInState),
            ReservationStatus::Released => Err(self.rejected("confirm")),
        }
    }

    /// `Reserved -> Released`. Debited stock is never silently given back.
    pub fn release(&mut self, reason: &str, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.status {
            ReservationStatus::Reserved => {
                self.mark_released(reason, now);
                Ok(Transition::Applied)
            }
            ReservationStatus::Released => Ok(Transition::AlreadyInState),
            ReservationStatus::Debited => Err(self.rejected("release")),
        }
    }

    /// `Reserved | Debited -> Released` for an order cancelled after confirmation.
    pub fn compensate(&mut self, reason: &str, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.status {
            ReservationStatus::Reserved | ReservationStatus::Debited => {
                self.mark_released(reason, now);
                Ok(Transition::Applied)
            }
            ReservationStatus::Released => Ok(Transition::AlreadyInState),
        }
    }

    fn mark_released(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = ReservationStatus::Released;
        self.processed_at = Some(now);
        self.release_reason = Some(reason.to_string());
    }

    fn rejected(&self, action: &'static str) -> DomainError {
        DomainError::invalid_transition("StockReservation", self.status, action)
    }
}
