//! Shared types: entities, the order status machine, and response DTOs.

use serde::{Deserialize, Serialize};

// ── Order status ─────────────────────────────────────────────────────

/// Lifecycle states of a production order.
///
/// `Draft` is the initial state, `Formed` and `Completed` follow in
/// sequence, and `Deleted` is the terminal logical-delete state reachable
/// from `Draft` and `Formed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Formed,
    Completed,
    Deleted,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Formed => "formed",
            OrderStatus::Completed => "completed",
            OrderStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OrderStatus::Draft),
            "formed" => Ok(OrderStatus::Formed),
            "completed" => Ok(OrderStatus::Completed),
            "deleted" => Ok(OrderStatus::Deleted),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────────

/// A registered account. Never serialized directly; responses go through
/// `UserProfile` so the password hash cannot leak.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
    pub is_moderator: bool,
}

/// Public view of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub login: String,
    pub is_moderator: bool,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            login: user.login,
            is_moderator: user.is_moderator,
        }
    }
}

/// A catalogue entry. Image keys are opaque names in the external object
/// store; empty string means no image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workshop {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub era: String,
    pub image_key: String,
    pub extra_image_key: String,
    pub is_deleted: bool,
}

/// Catalogue listing element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkshopSummary {
    pub id: i64,
    pub name: String,
    pub era: String,
    pub image_key: String,
}

/// A production order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub status: OrderStatus,
    pub created_at: String,
    pub creator_id: i64,
    pub formed_at: Option<String>,
    pub completed_at: Option<String>,
    pub moderator_id: Option<i64>,
    pub production_name: Option<String>,
}

/// One line of an order: a workshop plus its inspection figures.
/// The (order, workshop) pair is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub workshop_id: i64,
    pub found_defects: i64,
    pub predicted_output: String,
}

// ── Response DTOs ────────────────────────────────────────────────────

/// Order listing element. `completed_items_count` counts line items whose
/// predicted output has been computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: i64,
    pub status: OrderStatus,
    pub created_at: String,
    pub creator_login: String,
    pub completed_items_count: i64,
}

/// Workshop fields embedded in an order detail item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkshopRef {
    pub id: i64,
    pub name: String,
    pub era: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetailItem {
    pub workshop: WorkshopRef,
    pub found_defects: i64,
    pub predicted_output: String,
}

/// Full order view returned by the detail route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub id: i64,
    pub status: OrderStatus,
    pub created_at: String,
    pub creator_login: String,
    pub production_name: Option<String>,
    pub formed_at: Option<String>,
    pub completed_at: Option<String>,
    pub moderator_login: Option<String>,
    pub items: Vec<OrderDetailItem>,
}

/// Summary of the caller's draft order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSummary {
    pub order_id: i64,
    pub item_count: i64,
}
