use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tradeflow_core::money::DEFAULT_CURRENCY;
use tradeflow_core::{
    Actor, Aggregate, AggregateRoot, CustomerId, DomainError, DomainResult, Money, OrderId,
    ProductId,
};
use tradeflow_events::{Event, OrderSnapshot, OrderStatus};

use crate::item::OrderItem;

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    customer_id: CustomerId,
    status: OrderStatus,
    items: Vec<OrderItem>,
    total: Money,
    cancellation_reason: Option<String>,
    created_at: Option<DateTime<Utc>>,
    created_by: Option<Actor>,
    updated_at: Option<DateTime<Utc>>,
    updated_by: Option<Actor>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            customer_id: CustomerId::from_uuid(Uuid::nil()),
            status: OrderStatus::Pending,
            items: Vec::new(),
            total: Money::usd(Default::default()),
            cancellation_reason: None,
            created_at: None,
            created_by: None,
            updated_at: None,
            updated_by: None,
            version: 0,
            created: false,
        }
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn item(&self, product_id: ProductId) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.product_id == product_id)
    }

    /// Sum of line totals, recomputed on every item mutation.
    pub fn total(&self) -> &Money {
        &self.total
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn created_by(&self) -> Option<&Actor> {
        self.created_by.as_ref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn updated_by(&self) -> Option<&Actor> {
        self.updated_by.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, OrderStatus::Pending)
    }

    /// Copy the current state out by value.
    pub fn snapshot(&self) -> DomainResult<OrderSnapshot> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(OrderSnapshot {
            order_id: self.id,
            customer_id: self.customer_id,
            status: self.status,
            lines: self
                .items
                .iter()
                .map(OrderItem::snapshot)
                .collect::<DomainResult<Vec<_>>>()?,
            total: self.total.clone(),
            created_at: self.created_at.unwrap_or_default(),
        })
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem.
///
/// Adding a product already on the order increases that line's quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateItemQuantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateItemQuantity {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkFulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFulfilled {
    pub order_id: OrderId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub actor: Actor,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    AddItem(AddItem),
    RemoveItem(RemoveItem),
    UpdateItemQuantity(UpdateItemQuantity),
    ConfirmOrder(ConfirmOrder),
    MarkFulfilled(MarkFulfilled),
    CancelOrder(CancelOrder),
}

impl OrderCommand {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderCommand::CreateOrder(c) => c.order_id,
            OrderCommand::AddItem(c) => c.order_id,
            OrderCommand::RemoveItem(c) => c.order_id,
            OrderCommand::UpdateItemQuantity(c) => c.order_id,
            OrderCommand::ConfirmOrder(c) => c.order_id,
            OrderCommand::MarkFulfilled(c) => c.order_id,
            OrderCommand::CancelOrder(c) => c.order_id,
        }
    }
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemQuantityUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantityUpdated {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub actor: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    ItemAdded(ItemAdded),
    ItemRemoved(ItemRemoved),
    ItemQuantityUpdated(ItemQuantityUpdated),
    OrderStatusChanged(OrderStatusChanged),
}

impl OrderEvent {
    fn actor(&self) -> &Actor {
        match self {
            OrderEvent::OrderCreated(e) => &e.actor,
            OrderEvent::ItemAdded(e) => &e.actor,
            OrderEvent::ItemRemoved(e) => &e.actor,
            OrderEvent::ItemQuantityUpdated(e) => &e.actor,
            OrderEvent::OrderStatusChanged(e) => &e.actor,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "sales.order.created",
            OrderEvent::ItemAdded(_) => "sales.order.item_added",
            OrderEvent::ItemRemoved(_) => "sales.order.item_removed",
            OrderEvent::ItemQuantityUpdated(_) => "sales.order.item_quantity_updated",
            OrderEvent::OrderStatusChanged(_) => "sales.order.status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::ItemAdded(e) => e.occurred_at,
            OrderEvent::ItemRemoved(e) => e.occurred_at,
            OrderEvent::ItemQuantityUpdated(e) => e.occurred_at,
            OrderEvent::OrderStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.customer_id = e.customer_id;
                self.status = OrderStatus::Pending;
                self.items.clear();
                self.created_at = Some(e.occurred_at);
                self.created_by = Some(e.actor.clone());
                self.created = true;
            }
            OrderEvent::ItemAdded(e) => {
                match self.items.iter_mut().find(|i| i.product_id == e.product_id) {
                    Some(existing) => existing.quantity = existing.quantity.saturating_add(e.quantity),
                    None => self.items.push(OrderItem {
                        product_id: e.product_id,
                        product_name: e.product_name.clone(),
                        quantity: e.quantity,
                        unit_price: e.unit_price.clone(),
                    }),
                }
                self.recalculate_total();
            }
            OrderEvent::ItemRemoved(e) => {
                self.items.retain(|i| i.product_id != e.product_id);
                self.recalculate_total();
            }
            OrderEvent::ItemQuantityUpdated(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.product_id == e.product_id) {
                    item.quantity = e.quantity;
                }
                self.recalculate_total();
            }
            OrderEvent::OrderStatusChanged(e) => {
                self.status = e.to;
                if e.to == OrderStatus::Cancelled {
                    self.cancellation_reason = e.reason.clone();
                }
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.updated_by = Some(event.actor().clone());

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::AddItem(cmd) => self.handle_add_item(cmd),
            OrderCommand::RemoveItem(cmd) => self.handle_remove_item(cmd),
            OrderCommand::UpdateItemQuantity(cmd) => self.handle_update_quantity(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            OrderCommand::MarkFulfilled(cmd) => self.handle_mark_fulfilled(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

fn positive_quantity(quantity: i64) -> DomainResult<u32> {
    if quantity <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    u32::try_from(quantity).map_err(|_| DomainError::validation("quantity is too large"))
}

impl Order {
    fn recalculate_total(&mut self) {
        // Inputs were checked in `handle`, so the sum cannot overflow here.
        let totals: Vec<Money> = self.items.iter().filter_map(|i| i.line_total().ok()).collect();
        if let Ok(total) = Money::sum(DEFAULT_CURRENCY, &totals) {
            self.total = total;
        }
    }

    /// The total the order would have with `items`, failing on overflow.
    fn projected_total(items: &[OrderItem]) -> DomainResult<Money> {
        let totals = items
            .iter()
            .map(OrderItem::line_total)
            .collect::<DomainResult<Vec<_>>>()?;
        Money::sum(DEFAULT_CURRENCY, &totals)
    }

    fn ensure_exists(&self, order_id: OrderId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_modifiable(&self) -> DomainResult<()> {
        if !self.is_modifiable() {
            return Err(DomainError::modification_not_allowed(format!(
                "items can only change while the order is Pending (status: {})",
                self.status
            )));
        }
        Ok(())
    }

    fn status_changed(
        &self,
        to: OrderStatus,
        actor: &Actor,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> OrderEvent {
        OrderEvent::OrderStatusChanged(OrderStatusChanged {
            order_id: self.id,
            from: self.status,
            to,
            actor: actor.clone(),
            reason,
            occurred_at,
        })
    }

    fn handle_create(&self, cmd: &CreateOrder) -> DomainResult<Vec<OrderEvent>> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        cmd.order_id.ensure_present()?;
        cmd.customer_id.ensure_present()?;

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id,
            actor: cmd.actor.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;
        self.ensure_modifiable()?;

        cmd.product_id.ensure_present()?;
        let quantity = positive_quantity(cmd.quantity)?;
        if cmd.unit_price.is_negative() {
            return Err(DomainError::validation("unit_price cannot be negative"));
        }
        if cmd.unit_price.currency() != DEFAULT_CURRENCY {
            return Err(DomainError::validation(format!(
                "orders are priced in {DEFAULT_CURRENCY}, got {}",
                cmd.unit_price.currency()
            )));
        }
        let name = cmd.product_name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("product_name cannot be empty"));
        }

        let mut projected = self.items.clone();
        match projected.iter_mut().find(|i| i.product_id == cmd.product_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .checked_add(quantity)
                    .ok_or_else(|| DomainError::validation("quantity is too large"))?;
            }
            None => projected.push(OrderItem {
                product_id: cmd.product_id,
                product_name: name.to_string(),
                quantity,
                unit_price: cmd.unit_price.clone(),
            }),
        }
        Self::projected_total(&projected)?;

        Ok(vec![OrderEvent::ItemAdded(ItemAdded {
            order_id: cmd.order_id,
            product_id: cmd.product_id,
            product_name: name.to_string(),
            quantity,
            unit_price: cmd.unit_price.clone(),
            actor: cmd.actor.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_item(&self, cmd: &RemoveItem) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;
        self.ensure_modifiable()?;

        if self.item(cmd.product_id).is_none() {
            return Err(DomainError::not_found());
        }

        Ok(vec![OrderEvent::ItemRemoved(ItemRemoved {
            order_id: cmd.order_id,
            product_id: cmd.product_id,
            actor: cmd.actor.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_quantity(&self, cmd: &UpdateItemQuantity) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;
        self.ensure_modifiable()?;

        let quantity = positive_quantity(cmd.quantity)?;
        let mut projected = self.items.clone();
        let Some(item) = projected.iter_mut().find(|i| i.product_id == cmd.product_id) else {
            return Err(DomainError::not_found());
        };
        item.quantity = quantity;
        Self::projected_total(&projected)?;

        Ok(vec![OrderEvent::ItemQuantityUpdated(ItemQuantityUpdated {
            order_id: cmd.order_id,
            product_id: cmd.product_id,
            quantity,
            actor: cmd.actor.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;

        if self.status != OrderStatus::Pending {
            return Err(DomainError::invalid_transition("Order", self.status, "confirm"));
        }
        if self.items.is_empty() {
            return Err(DomainError::invariant("cannot confirm an order without items"));
        }

        Ok(vec![self.status_changed(
            OrderStatus::Confirmed,
            &cmd.actor,
            None,
            cmd.occurred_at,
        )])
    }

    fn handle_mark_fulfilled(&self, cmd: &MarkFulfilled) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;

        if self.status != OrderStatus::Confirmed {
            return Err(DomainError::invalid_transition("Order", self.status, "fulfil"));
        }

        Ok(vec![self.status_changed(
            OrderStatus::Fulfilled,
            &cmd.actor,
            None,
            cmd.occurred_at,
        )])
    }

    /// Fulfilled orders go through returns instead; cancelling twice is a conflict.
    fn handle_cancel(&self, cmd: &CancelOrder) -> DomainResult<Vec<OrderEvent>> {
        self.ensure_exists(cmd.order_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition("Order", self.status, "cancel"));
        }

        let reason = cmd
            .reason
            .as_ref()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        Ok(vec![self.status_changed(
            OrderStatus::Cancelled,
            &cmd.actor,
            reason,
            cmd.occurred_at,
        )])
    }
}
