//! Domain types shared by the order service crates.
//!
//! Money is carried as [`Decimal`] end to end, matching the `DECIMAL(10,2)`
//! columns of the store. Serialized amounts are strings (`"109.97"`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Largest amount representable by a `DECIMAL(10,2)` column.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_409_065_407, 2, 0, false, 2);

/// Fractional digits kept for every stored amount.
pub const AMOUNT_SCALE: u32 = 2;

/// Lifecycle states an order is expected to move through.
///
/// The persisted `status` column is a plain string; this enum names the
/// values the rest of the system agrees on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `status` is one of the enumerated values.
    pub fn is_known(status: &str) -> bool {
        status.parse::<OrderStatus>().is_ok()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown order status '{s}'"))
    }
}

/// Order — the parent record of a placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: i32,
    pub user_id: Option<i32>,
    pub total_amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// OrderItem — one priced line of an order.
///
/// `unit_price` is the price resolved at placement time, not the product's
/// current price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItem {
    pub id: i32,
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
}

/// An order as returned by a successful placement: the row plus the items
/// written in the same unit of work, in input order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacedOrder {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Order joined to its (optional) owner, as listed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderSummary {
    #[serde(flatten)]
    pub order: Order,
    pub username: Option<String>,
}

/// Order item joined to its product's display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItemView {
    #[serde(flatten)]
    pub item: OrderItem,
    pub product_name: Option<String>,
}

/// Full read model of a single order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub username: Option<String>,
    pub items: Vec<OrderItemView>,
}

/// One requested line of a placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: i32,
    pub quantity: i32,
    /// Price the caller believes applies. Accepted but never used for pricing.
    #[serde(default, rename = "unit_price", skip_serializing_if = "Option::is_none")]
    pub unit_price_hint: Option<Decimal>,
}

/// A placement request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewOrder {
    #[serde(default)]
    pub user_id: Option<i32>,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}
