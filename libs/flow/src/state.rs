//! Per-conversation flow snapshot, persisted as an opaque JSON document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wg_core::catalog::{MenuCategory, MenuItem};
use wg_core::types::{BranchRef, DeliveryAddress, OrderItem, OrderType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    #[default]
    New,
    AwaitingType,
    AwaitingLocation,
    AwaitingBranch,
    BrowsingCategories,
    BrowsingItems,
    AwaitingQuantity,
    CartOverview,
    AwaitingRemoval,
    Checkout,
    AwaitingPayment,
    OrderSubmitted,
    Tracking,
    Handover,
}

/// Item staged between selection and quantity confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub item: MenuItem,
}

/// Everything the engine needs to resume a conversation. Replaces the
/// source system's process-local carts and welcomed-user sets with a durable
/// record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRecord {
    pub state: FlowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cart: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<DeliveryAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_options: Vec<BranchRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_options: Vec<MenuCategory>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_options: Vec<MenuItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_category: Option<MenuCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_order_id: Option<String>,
}

impl FlowRecord {
    pub fn from_value(value: Option<Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn cart_total_minor(&self) -> i64 {
        self.cart.iter().map(OrderItem::line_total_minor).sum()
    }

    /// Starts a fresh flow, keeping only the customer identity.
    pub fn reset(&mut self) {
        let name = self.customer_name.take();
        *self = FlowRecord {
            customer_name: name,
            ..FlowRecord::default()
        };
    }

    /// Adds to an existing cart line when the same item is committed again.
    pub fn commit_pending(&mut self, quantity: u32) -> Option<OrderItem> {
        let pending = self.pending.take()?;
        let line = OrderItem {
            item_id: pending.item.id.clone(),
            name: pending.item.name.clone(),
            quantity,
            unit_price_minor: pending.item.price_minor,
        };
        if let Some(existing) = self.cart.iter_mut().find(|l| l.item_id == line.item_id) {
            existing.quantity += quantity;
            return Some(existing.clone());
        }
        self.cart.push(line.clone());
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str, price: i64) -> MenuItem {
        MenuItem {
            id: id.into(),
            category_id: "cat_1".into(),
            name: name.into(),
            price_minor: price,
        }
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut record = FlowRecord::default();
        record.state = FlowState::AwaitingQuantity;
        record.pending = Some(PendingItem {
            item: item("item_1", "برجر", 1500),
        });
        record.customer_name = Some("أحمد".into());

        let restored = FlowRecord::from_value(Some(record.to_value()));
        assert_eq!(restored.state, FlowState::AwaitingQuantity);
        assert_eq!(restored.pending.unwrap().item.name, "برجر");
        assert_eq!(restored.customer_name.as_deref(), Some("أحمد"));
    }

    #[test]
    fn missing_snapshot_defaults_to_new() {
        let record = FlowRecord::from_value(None);
        assert_eq!(record.state, FlowState::New);
        assert!(record.cart.is_empty());
    }

    #[test]
    fn commit_pending_merges_same_item() {
        let mut record = FlowRecord::default();
        record.pending = Some(PendingItem {
            item: item("item_1", "برجر", 1500),
        });
        record.commit_pending(2);
        record.pending = Some(PendingItem {
            item: item("item_1", "برجر", 1500),
        });
        record.commit_pending(1);

        assert_eq!(record.cart.len(), 1);
        assert_eq!(record.cart[0].quantity, 3);
        assert_eq!(record.cart_total_minor(), 4500);
    }

    #[test]
    fn reset_keeps_customer_name() {
        let mut record = FlowRecord::default();
        record.state = FlowState::OrderSubmitted;
        record.customer_name = Some("سارة".into());
        record.cart.push(OrderItem {
            item_id: "item_1".into(),
            name: "برجر".into(),
            quantity: 1,
            unit_price_minor: 1500,
        });
        record.reset();
        assert_eq!(record.state, FlowState::New);
        assert!(record.cart.is_empty());
        assert_eq!(record.customer_name.as_deref(), Some("سارة"));
    }
}
