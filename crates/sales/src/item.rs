use serde::{Deserialize, Serialize};

use tradeflow_core::{DomainResult, Entity, Money, ProductId};
use tradeflow_events::OrderLineSnapshot;

/// A line of an order, keyed by product within its order.
///
/// Name and unit price are snapshots taken when the product was first added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderItem {
    pub fn line_total(&self) -> DomainResult<Money> {
        self.unit_price.times(self.quantity)
    }

    pub fn snapshot(&self) -> DomainResult<OrderLineSnapshot> {
        Ok(OrderLineSnapshot {
            product_id: self.product_id,
            product_name: self.product_name.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price.clone(),
            line_total: self.line_total()?,
        })
    }
}

impl Entity for OrderItem {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.product_id
    }
}
