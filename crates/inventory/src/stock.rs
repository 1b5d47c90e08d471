use serde::{Deserialize, Serialize};

use tradeflow_core::{DomainError, DomainResult, ProductId};

/// On-hand stock for one product.
///
/// Stock is debited when a reservation is taken and given back when it is
/// released, so `on_hand` is also the quantity available to promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub name: String,
    pub on_hand: i64,
    /// Row version, bumped on every change.
    pub version: u64,
}

impl ProductStock {
    pub fn new(product_id: ProductId, name: impl Into<String>, on_hand: i64) -> Self {
        Self {
            product_id,
            name: name.into(),
            on_hand,
            version: 0,
        }
    }

    pub fn can_supply(&self, quantity: u32) -> bool {
        i64::from(quantity) <= self.on_hand
    }

    pub fn debit(&mut self, quantity: u32) -> DomainResult<()> {
        if !self.can_supply(quantity) {
            return Err(DomainError::insufficient_stock(
                self.product_id,
                quantity,
                self.on_hand,
            ));
        }
        self.on_hand -= i64::from(quantity);
        self.version += 1;
        Ok(())
    }

    /// Give back stock taken by a reservation.
    pub fn restore(&mut self, quantity: u32) {
        self.on_hand += i64::from(quantity);
        self.version += 1;
    }

    pub fn receive(&mut self, quantity: u32) -> DomainResult<()> {
        if quantity == 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        self.restore(quantity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_beyond_on_hand_reports_availability() {
        let mut stock = ProductStock::new(ProductId::new(), "Widget", 4);
        let err = stock.debit(6).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InsufficientStock { requested: 6, available: 4, .. }
        ));
        assert_eq!(stock.on_hand, 4);
        assert_eq!(stock.version, 0);
    }

    #[test]
    fn debit_and_restore_bump_the_version() {
        let mut stock = ProductStock::new(ProductId::new(), "Widget", 10);
        stock.debit(10).unwrap();
        assert_eq!(stock.on_hand, 0);
        stock.restore(3);
        assert_eq!(stock.on_hand, 3);
        assert_eq!(stock.version, 2);
    }

    #[test]
    fn receiving_nothing_is_rejected() {
        let mut stock = ProductStock::new(ProductId::new(), "Widget", 0);
        assert!(stock.receive(0).is_err());
        stock.receive(5).unwrap();
        assert_eq!(stock.on_hand, 5);
    }
}
