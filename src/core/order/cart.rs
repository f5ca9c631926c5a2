//! Cart data and the bounds every line must respect.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Largest quantity a single cart line may carry.
pub const MAX_LINE_QUANTITY: u32 = 100;

/// Bounds applied to cart lines before they are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderLimits {
    pub min_quantity: u32,
    pub max_quantity: u32,
    pub max_notes_chars: usize,
}

impl Default for OrderLimits {
    fn default() -> Self {
        Self {
            min_quantity: 1,
            max_quantity: MAX_LINE_QUANTITY,
            max_notes_chars: 1000,
        }
    }
}

impl OrderLimits {
    /// Clamp a requested quantity into range. Logs when the value changes.
    pub fn clamp_quantity(&self, requested: i64) -> u32 {
        let clamped = requested.clamp(self.min_quantity as i64, self.max_quantity as i64) as u32;
        if clamped as i64 != requested {
            warn!(requested, clamped, "Quantity out of range, clamped");
        }
        clamped
    }

    /// Truncate notes to the character limit. Logs when truncated.
    pub fn truncate_notes(&self, notes: &str) -> String {
        let count = notes.chars().count();
        if count <= self.max_notes_chars {
            return notes.to_string();
        }
        warn!(
            chars = count,
            limit = self.max_notes_chars,
            "Notes exceed limit, truncated"
        );
        notes.chars().take(self.max_notes_chars).collect()
    }
}

/// Clamp a modifier price to be non-negative. Logs when clamped.
pub fn clamp_modifier_price(name: &str, price_cents: i64) -> i64 {
    if price_cents < 0 {
        warn!(modifier = %name, price_cents, "Negative modifier price, clamped to 0");
        0
    } else {
        price_cents
    }
}

/// A modifier applied to a cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartModifier {
    pub name: String,
    /// Always `>= 0`
    pub price_cents: i64,
}

/// One line of the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Cart line id (`line-N`), stable for the life of the cart
    pub id: String,
    pub menu_item_id: String,
    pub name: String,
    pub unit_price_cents: i64,
    /// Always within `OrderLimits` bounds
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<CartModifier>,
}

impl CartItem {
    /// Unit price plus modifiers, times quantity.
    pub fn line_total_cents(&self) -> i64 {
        let modifiers: i64 = self.modifiers.iter().map(|m| m.price_cents).sum();
        (self.unit_price_cents + modifiers) * self.quantity as i64
    }
}

/// The order being built in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
    next_line: u64,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of units across lines.
    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    pub fn subtotal_cents(&self) -> i64 {
        self.items.iter().map(CartItem::line_total_cents).sum()
    }

    /// Append a line and return its id. The line's `id` field is overwritten.
    pub(crate) fn push(&mut self, mut item: CartItem) -> String {
        self.next_line += 1;
        item.id = format!("line-{}", self.next_line);
        let id = item.id.clone();
        self.items.push(item);
        id
    }

    pub(crate) fn get_mut(&mut self, line_id: &str) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|item| item.id == line_id)
    }

    /// Id of the most recently added line for a menu item.
    pub fn latest_line_for(&self, menu_item_id: &str) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|item| item.menu_item_id == menu_item_id)
            .map(|item| item.id.as_str())
    }

    pub fn contains_line(&self, line_id: &str) -> bool {
        self.items.iter().any(|item| item.id == line_id)
    }

    pub(crate) fn remove(&mut self, line_id: &str) -> Option<CartItem> {
        let index = self.items.iter().position(|item| item.id == line_id)?;
        Some(self.items.remove(index))
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
