//! The reservation engine.
//!
//! A [`StockBook`] holds product stock and reservations. It is either the whole
//! inventory (in-memory store) or just the rows a transaction has locked
//! (Postgres store). `execute` is all-or-nothing: on error the book is
//! unchanged, on success the outcome lists every row that must be written.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{
    CorrelationId, DomainError, DomainResult, OrderId, ProductId, ReservationId,
};

use crate::reservation::{ReservationStatus, StockReservation, Transition};
use crate::stock::ProductStock;

/// Default release reason for cancelled orders.
pub const ORDER_CANCELLED: &str = "order cancelled";

/// One product line to reserve or release for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
}

/// A line that could not be covered by on-hand stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    pub product_id: ProductId,
    pub requested: u32,
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockCommand {
    /// Reserve every line of an order, debiting stock. With `confirm` the new
    /// reservations go straight to `Debited`.
    ReserveOrder {
        order_id: OrderId,
        lines: Vec<ReservationLine>,
        correlation_id: Option<CorrelationId>,
        confirm: bool,
    },
    ConfirmReservation {
        reservation_id: ReservationId,
    },
    ReleaseReservation {
        reservation_id: ReservationId,
        reason: String,
    },
    /// Release an order's reservations. `compensate` also gives back stock of
    /// `Debited` reservations; lines never reserved get a `Released` tombstone.
    ReleaseOrder {
        order_id: OrderId,
        lines: Vec<ReservationLine>,
        correlation_id: Option<CorrelationId>,
        compensate: bool,
        reason: Option<String>,
    },
    ReceiveStock {
        product_id: ProductId,
        product_name: String,
        quantity: u32,
    },
}

impl StockCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StockCommand::ReserveOrder { .. } => "reserve_order",
            StockCommand::ConfirmReservation { .. } => "confirm_reservation",
            StockCommand::ReleaseReservation { .. } => "release_reservation",
            StockCommand::ReleaseOrder { .. } => "release_order",
            StockCommand::ReceiveStock { .. } => "receive_stock",
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            StockCommand::ReserveOrder { order_id, .. }
            | StockCommand::ReleaseOrder { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }

    /// Products named directly by the command, sorted and unique.
    ///
    /// Stores lock product rows in this order to avoid deadlocks.
    pub fn product_ids(&self) -> Vec<ProductId> {
        let mut ids: Vec<ProductId> = match self {
            StockCommand::ReserveOrder { lines, .. } | StockCommand::ReleaseOrder { lines, .. } => {
                lines.iter().map(|l| l.product_id).collect()
            }
            StockCommand::ReceiveStock { product_id, .. } => vec![*product_id],
            StockCommand::ConfirmReservation { .. } | StockCommand::ReleaseReservation { .. } => {
                Vec::new()
            }
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Rows touched by one successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockOutcome {
    /// Reservations the command addressed, post-command, in line order.
    pub reservations: Vec<StockReservation>,
    pub changed_products: Vec<ProductStock>,
    pub changed_reservations: Vec<StockReservation>,
    /// Reservations whose stock this command gave back.
    pub released: Vec<StockReservation>,
}

impl StockOutcome {
    /// Every addressed reservation was already in the requested state.
    pub fn is_noop(&self) -> bool {
        self.changed_products.is_empty() && self.changed_reservations.is_empty()
    }
}

#[derive(Default)]
struct Changes {
    products: BTreeMap<ProductId, ProductStock>,
    reservations: BTreeMap<ReservationId, StockReservation>,
    released: Vec<ReservationId>,
}

impl Changes {
    fn product<'a>(&'a mut self, book: &StockBook, id: ProductId) -> Option<&'a mut ProductStock> {
        if !self.products.contains_key(&id) {
            let current = book.products.get(&id)?.clone();
            self.products.insert(id, current);
        }
        self.products.get_mut(&id)
    }

    fn restore(&mut self, book: &StockBook, reservation: &StockReservation) -> DomainResult<()> {
        let product = self.product(book, reservation.product_id).ok_or_else(|| {
            DomainError::invariant(format!(
                "reservation {} references unknown product {}",
                reservation.id, reservation.product_id
            ))
        })?;
        product.restore(reservation.quantity);
        self.released.push(reservation.id);
        Ok(())
    }

    fn put(&mut self, reservation: StockReservation) {
        self.reservations.insert(reservation.id, reservation);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StockBook {
    products: BTreeMap<ProductId, ProductStock>,
    reservations: BTreeMap<ReservationId, StockReservation>,
    by_order: BTreeMap<OrderId, BTreeMap<ProductId, ReservationId>>,
}

impl StockBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_product(&mut self, product: ProductStock) {
        self.products.insert(product.product_id, product);
    }

    pub fn insert_reservation(&mut self, reservation: StockReservation) {
        self.by_order
            .entry(reservation.order_id)
            .or_default()
            .insert(reservation.product_id, reservation.id);
        self.reservations.insert(reservation.id, reservation);
    }

    pub fn product(&self, product_id: ProductId) -> Option<&ProductStock> {
        self.products.get(&product_id)
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductStock> {
        self.products.values()
    }

    pub fn reservation(&self, reservation_id: ReservationId) -> Option<&StockReservation> {
        self.reservations.get(&reservation_id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &StockReservation> {
        self.reservations.values()
    }

    pub fn reservation_for(
        &self,
        order_id: OrderId,
        product_id: ProductId,
    ) -> Option<&StockReservation> {
        self.by_order
            .get(&order_id)
            .and_then(|lines| lines.get(&product_id))
            .and_then(|id| self.reservations.get(id))
    }

    pub fn reservations_for_order(&self, order_id: OrderId) -> Vec<&StockReservation> {
        self.by_order
            .get(&order_id)
            .map(|lines| {
                lines
                    .values()
                    .filter_map(|id| self.reservations.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `Reserved` rows older than `ttl`.
    pub fn expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<ReservationId> {
        self.reservations
            .values()
            .filter(|r| r.is_expired(now, ttl))
            .map(|r| r.id)
            .collect()
    }

    /// Lines of `order_id` that need a new reservation but lack stock.
    pub fn shortages(&self, order_id: OrderId, lines: &[ReservationLine]) -> Vec<Shortage> {
        merge_lines(lines)
            .iter()
            .filter(|l| self.reservation_for(order_id, l.product_id).is_none())
            .filter_map(|l| {
                let available = self.products.get(&l.product_id).map(|p| p.on_hand).unwrap_or(0);
                (i64::from(l.quantity) > available).then(|| Shortage {
                    product_id: l.product_id,
                    requested: l.quantity,
                    available,
                })
            })
            .collect()
    }

    pub fn execute(&mut self, command: StockCommand, now: DateTime<Utc>) -> DomainResult<StockOutcome> {
        let (changes, addressed) = match command {
            StockCommand::ReserveOrder {
                order_id,
                lines,
                correlation_id,
                confirm,
            } => self.plan_reserve(order_id, &lines, correlation_id, confirm, now)?,
            StockCommand::ConfirmReservation { reservation_id } => {
                self.plan_confirm(reservation_id, now)?
            }
            StockCommand::ReleaseReservation {
                reservation_id,
                reason,
            } => self.plan_release(reservation_id, &reason, now)?,
            StockCommand::ReleaseOrder {
                order_id,
                lines,
                correlation_id,
                compensate,
                reason,
            } => self.plan_release_order(
                order_id,
                &lines,
                correlation_id,
                compensate,
                reason.as_deref().unwrap_or(ORDER_CANCELLED),
                now,
            )?,
            StockCommand::ReceiveStock {
                product_id,
                product_name,
                quantity,
            } => self.plan_receive(product_id, &product_name, quantity)?,
        };

        Ok(self.commit(changes, addressed))
    }

    fn commit(&mut self, changes: Changes, addressed: Vec<ReservationId>) -> StockOutcome {
        let released = changes.released;
        let changed_products: Vec<ProductStock> = changes.products.into_values().collect();
        let changed_reservations: Vec<StockReservation> =
            changes.reservations.into_values().collect();

        for product in &changed_products {
            self.insert_product(product.clone());
        }
        for reservation in &changed_reservations {
            self.insert_reservation(reservation.clone());
        }

        let current = |ids: &[ReservationId]| -> Vec<StockReservation> {
            ids.iter()
                .filter_map(|id| self.reservations.get(id).cloned())
                .collect()
        };
        StockOutcome {
            reservations: current(&addressed),
            released: current(&released),
            changed_products,
            changed_reservations,
        }
    }

    fn plan_reserve(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        correlation_id: Option<CorrelationId>,
        confirm: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<(Changes, Vec<ReservationId>)> {
        order_id.ensure_present()?;
        let lines = merge_lines(lines);
        if lines.is_empty() {
            return Err(DomainError::validation("nothing to reserve"));
        }
        for line in &lines {
            line.product_id.ensure_present()?;
            if line.quantity == 0 {
                return Err(DomainError::validation("reservation quantity must be positive"));
            }
        }

        // A released line means the order was cancelled; never reserve again.
        if let Some(released) = lines
            .iter()
            .filter_map(|l| self.reservation_for(order_id, l.product_id))
            .find(|r| r.status == ReservationStatus::Released)
        {
            return Err(DomainError::invalid_transition(
                "StockReservation",
                released.status,
                "reserve",
            ));
        }

        if let Some(shortage) = self.shortages(order_id, &lines).into_iter().next() {
            return Err(DomainError::insufficient_stock(
                shortage.product_id,
                shortage.requested,
                shortage.available,
            ));
        }

        let mut changes = Changes::default();
        let mut addressed = Vec::with_capacity(lines.len());

        for line in &lines {
            if let Some(existing) = self.reservation_for(order_id, line.product_id) {
                if confirm {
                    let mut reservation = existing.clone();
                    if reservation.confirm(now)? == Transition::Applied {
                        changes.put(reservation);
                    }
                }
                addressed.push(existing.id);
                continue;
            }

            let product = changes
                .product(self, line.product_id)
                .ok_or_else(|| DomainError::insufficient_stock(line.product_id, line.quantity, 0))?;
            product.debit(line.quantity)?;

            let mut reservation = StockReservation::new_reserved(
                order_id,
                line.product_id,
                line.product_name.clone(),
                line.quantity,
                correlation_id.clone(),
                now,
            )?;
            if confirm {
                reservation.confirm(now)?;
            }
            addressed.push(reservation.id);
            changes.put(reservation);
        }

        Ok((changes, addressed))
    }

    fn existing(&self, reservation_id: ReservationId) -> DomainResult<StockReservation> {
        self.reservations
            .get(&reservation_id)
            .cloned()
            .ok_or_else(DomainError::not_found)
    }

    fn plan_confirm(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> DomainResult<(Changes, Vec<ReservationId>)> {
        let mut reservation = self.existing(reservation_id)?;
        let mut changes = Changes::default();
        if reservation.confirm(now)? == Transition::Applied {
            changes.put(reservation);
        }
        Ok((changes, vec![reservation_id]))
    }

    fn plan_release(
        &self,
        reservation_id: ReservationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<(Changes, Vec<ReservationId>)> {
        let mut reservation = self.existing(reservation_id)?;
        let mut changes = Changes::default();
        if reservation.release(reason, now)? == Transition::Applied {
            changes.restore(self, &reservation)?;
            changes.put(reservation);
        }
        Ok((changes, vec![reservation_id]))
    }

    fn plan_release_order(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        correlation_id: Option<CorrelationId>,
        compensate: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<(Changes, Vec<ReservationId>)> {
        order_id.ensure_present()?;
        let mut changes = Changes::default();
        let mut addressed = Vec::new();

        for existing in self.reservations_for_order(order_id) {
            let mut reservation = existing.clone();
            let transition = if compensate {
                reservation.compensate(reason, now)?
            } else {
                reservation.release(reason, now)?
            };
            if transition == Transition::Applied {
                changes.restore(self, &reservation)?;
                changes.put(reservation);
            }
            addressed.push(existing.id);
        }

        for line in merge_lines(lines) {
            if self.reservation_for(order_id, line.product_id).is_some() {
                continue;
            }
            let tombstone = StockReservation::tombstone(
                order_id,
                line.product_id,
                line.product_name,
                line.quantity,
                correlation_id.clone(),
                reason,
                now,
            );
            addressed.push(tombstone.id);
            changes.put(tombstone);
        }

        Ok((changes, addressed))
    }

    fn plan_receive(
        &self,
        product_id: ProductId,
        product_name: &str,
        quantity: u32,
    ) -> DomainResult<(Changes, Vec<ReservationId>)> {
        product_id.ensure_present()?;
        let mut changes = Changes::default();

        match changes.product(self, product_id) {
            Some(product) => product.receive(quantity)?,
            None => {
                let name = product_name.trim();
                if name.is_empty() {
                    return Err(DomainError::validation("product_name cannot be empty"));
                }
                if quantity == 0 {
                    return Err(DomainError::validation("received quantity must be positive"));
                }
                changes
                    .products
                    .insert(product_id, ProductStock::new(product_id, name, i64::from(quantity)));
            }
        }

        Ok((changes, Vec::new()))
    }
}

/// Collapse repeated products into one line, keeping first-seen order and name.
fn merge_lines(lines: &[ReservationLine]) -> Vec<ReservationLine> {
    let mut merged: Vec<ReservationLine> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.iter_mut().find(|m| m.product_id == line.product_id) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(line.quantity),
            None => merged.push(line.clone()),
        }
    }
    merged
}
