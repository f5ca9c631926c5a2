//! Serialized cart mutation.
//!
//! The model may emit several function calls in one response. Each completed call
//! is queued to an [`OrderGateWorker`], which applies them one at a time through
//! the [`OrderMutationGate`]. The gate holds the cart behind a session-scoped
//! mutex, so direct callers (UI edits) and the worker never interleave.
//! Every mutation returns a full cart snapshot taken under the same lock.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cart::{Cart, CartItem, CartModifier, OrderLimits, clamp_modifier_price};
use super::matcher::{self, MatcherConfig};
use super::menu::{MenuCatalog, MenuItem};
use super::tools::{ModifierArg, OrderCommand};
use crate::errors::{MutationError, MutationResult};

// =============================================================================
// Configuration
// =============================================================================

/// Order gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderGateConfig {
    /// Cart mutex acquisition timeout (milliseconds). Expiry is fatal.
    pub lock_timeout_ms: u64,
    /// Menu catalog lookup timeout (milliseconds)
    pub catalog_timeout_ms: u64,
    pub limits: OrderLimits,
    pub matcher: MatcherConfig,
}

impl Default for OrderGateConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            catalog_timeout_ms: 3000,
            limits: OrderLimits::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

// =============================================================================
// Calls and Outcomes
// =============================================================================

/// A completed function call waiting for the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFunctionCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON arguments as assembled from the stream
    pub arguments: String,
    /// Set when the gate acquires the cart lock for this call
    pub mutex_acquired_at: Option<Instant>,
}

impl PendingFunctionCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
            mutex_acquired_at: None,
        }
    }
}

/// Result of applying one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub call: PendingFunctionCall,
    pub result: MutationResult<Cart>,
}

impl MutationOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(&self.result, Err(e) if e.is_fatal())
    }

    /// JSON returned to the model as the function call output.
    pub fn output_json(&self) -> String {
        let value = match &self.result {
            Ok(cart) => json!({
                "success": true,
                "cart": cart_summary(cart),
            }),
            Err(MutationError::MenuItemNotFound { query, suggestion }) => json!({
                "success": false,
                "error": format!("No menu item matches '{query}'"),
                "needs_clarification": true,
                "suggestion": suggestion,
            }),
            Err(e) => json!({
                "success": false,
                "error": e.to_string(),
                "needs_clarification": e.needs_clarification(),
            }),
        };
        value.to_string()
    }
}

fn cart_summary(cart: &Cart) -> serde_json::Value {
    let items: Vec<serde_json::Value> = cart
        .items()
        .iter()
        .map(|item| {
            json!({
                "id": item.id,
                "name": item.name,
                "quantity": item.quantity,
                "notes": item.notes,
                "modifiers": item.modifiers.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "items": items,
        "subtotal_cents": cart.subtotal_cents(),
    })
}

// =============================================================================
// Gate
// =============================================================================

/// Mutex-guarded cart operations.
#[derive(Clone)]
pub struct OrderMutationGate {
    cart: Arc<Mutex<Cart>>,
    catalog: Arc<dyn MenuCatalog>,
    config: Arc<OrderGateConfig>,
}

impl OrderMutationGate {
    pub fn new(catalog: Arc<dyn MenuCatalog>, config: OrderGateConfig) -> Self {
        Self::with_cart(Cart::new(), catalog, config)
    }

    /// Gate over an existing cart.
    pub fn with_cart(cart: Cart, catalog: Arc<dyn MenuCatalog>, config: OrderGateConfig) -> Self {
        Self {
            cart: Arc::new(Mutex::new(cart)),
            catalog,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &OrderGateConfig {
        &self.config
    }

    /// Add a menu item resolved from a spoken reference.
    pub async fn add_item(
        &self,
        menu_ref: &str,
        quantity: i64,
        notes: Option<&str>,
        modifiers: &[ModifierArg],
    ) -> MutationResult<Cart> {
        let items = self.menu_items().await?;
        let menu_item = self.resolve(menu_ref, &items)?;

        let limits = &self.config.limits;
        let quantity = limits.clamp_quantity(quantity);
        let notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| limits.truncate_notes(n));
        let modifiers = modifiers
            .iter()
            .map(|m| resolve_modifier(menu_item, m))
            .collect();

        let line = CartItem {
            id: String::new(),
            menu_item_id: menu_item.id.clone(),
            name: menu_item.name.clone(),
            unit_price_cents: menu_item.price_cents.max(0),
            quantity,
            notes,
            modifiers,
        };

        let mut cart = self.lock().await?;
        let line_id = cart.push(line);
        info!(line_id = %line_id, item = %menu_item.name, quantity, "Added item to cart");
        Ok(cart.clone())
    }

    /// Remove a cart line by line id or menu reference.
    pub async fn remove_item(&self, item_ref: &str) -> MutationResult<Cart> {
        let items = self.menu_items().await?;
        let mut cart = self.lock().await?;
        let line_id = self.find_line(&cart, item_ref, &items)?;
        if let Some(removed) = cart.remove(&line_id) {
            info!(line_id = %line_id, item = %removed.name, "Removed item from cart");
        }
        Ok(cart.clone())
    }

    /// Set the quantity of a cart line.
    pub async fn update_quantity(&self, item_ref: &str, quantity: i64) -> MutationResult<Cart> {
        let items = self.menu_items().await?;
        let quantity = self.config.limits.clamp_quantity(quantity);
        let mut cart = self.lock().await?;
        let line_id = self.find_line(&cart, item_ref, &items)?;
        if let Some(line) = cart.get_mut(&line_id) {
            line.quantity = quantity;
            info!(line_id = %line_id, quantity, "Updated item quantity");
        }
        Ok(cart.clone())
    }

    /// Apply a modifier to a cart line, replacing one with the same name.
    pub async fn apply_modifier(&self, item_ref: &str, modifier: &ModifierArg) -> MutationResult<Cart> {
        let items = self.menu_items().await?;
        let mut cart = self.lock().await?;
        let line_id = self.find_line(&cart, item_ref, &items)?;
        let Some(line) = cart.get_mut(&line_id) else {
            return Err(MutationError::CartItemNotFound(item_ref.to_string()));
        };

        let resolved = match items.iter().find(|item| item.id == line.menu_item_id) {
            Some(menu_item) => resolve_modifier(menu_item, modifier),
            None => CartModifier {
                name: modifier.name().trim().to_string(),
                price_cents: clamp_modifier_price(
                    modifier.name(),
                    modifier.price_adjustment().unwrap_or(0),
                ),
            },
        };
        line.modifiers
            .retain(|m| !m.name.eq_ignore_ascii_case(&resolved.name));
        info!(line_id = %line_id, modifier = %resolved.name, "Applied modifier");
        line.modifiers.push(resolved);
        Ok(cart.clone())
    }

    /// Empty the cart.
    pub async fn clear(&self) -> MutationResult<Cart> {
        let mut cart = self.lock().await?;
        cart.clear();
        info!("Cleared cart");
        Ok(cart.clone())
    }

    /// Current cart.
    pub async fn snapshot(&self) -> MutationResult<Cart> {
        let cart = self.lock().await?;
        Ok(cart.clone())
    }

    /// Apply a function call from the model.
    pub async fn execute(&self, call: &mut PendingFunctionCall) -> MutationResult<Cart> {
        debug!(call_id = %call.call_id, name = %call.name, "Executing function call");
        let command = OrderCommand::parse(&call.name, &call.arguments)?;
        call.mutex_acquired_at = Some(Instant::now());

        match command {
            OrderCommand::Add(args) => {
                self.add_item(&args.id, args.quantity, args.notes.as_deref(), &args.modifiers)
                    .await
            }
            OrderCommand::Remove { item_ref } => self.remove_item(&item_ref).await,
            OrderCommand::UpdateQuantity { item_ref, quantity } => {
                self.update_quantity(&item_ref, quantity).await
            }
            OrderCommand::ApplyModifier { item_ref, modifier } => {
                self.apply_modifier(&item_ref, &modifier).await
            }
            OrderCommand::Clear => self.clear().await,
        }
    }

    async fn lock(&self) -> MutationResult<MutexGuard<'_, Cart>> {
        let waited = Duration::from_millis(self.config.lock_timeout_ms);
        match tokio::time::timeout(waited, self.cart.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!(waited_ms = self.config.lock_timeout_ms, "Cart lock acquisition timed out");
                Err(MutationError::LockTimeout {
                    waited_ms: self.config.lock_timeout_ms,
                })
            }
        }
    }

    async fn menu_items(&self) -> MutationResult<Arc<[MenuItem]>> {
        let timeout = Duration::from_millis(self.config.catalog_timeout_ms);
        match tokio::time::timeout(timeout, self.catalog.items()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.config.catalog_timeout_ms, "Menu catalog lookup timed out");
                Err(MutationError::Catalog(format!(
                    "lookup timed out after {}ms",
                    self.config.catalog_timeout_ms
                )))
            }
        }
    }

    fn resolve<'a>(&self, menu_ref: &str, items: &'a [MenuItem]) -> MutationResult<&'a MenuItem> {
        match matcher::resolve(menu_ref, items, &self.config.matcher) {
            Ok(found) => {
                debug!(
                    query = %menu_ref,
                    item = %found.item.name,
                    kind = ?found.kind,
                    score = found.score,
                    "Resolved menu reference"
                );
                Ok(found.item)
            }
            Err(e) => {
                info!(query = %menu_ref, error = %e, "Menu reference needs clarification");
                Err(e)
            }
        }
    }

    /// Cart line for `item_ref`: an exact line id, else the latest line of the resolved menu item.
    fn find_line(&self, cart: &Cart, item_ref: &str, items: &[MenuItem]) -> MutationResult<String> {
        if cart.contains_line(item_ref) {
            return Ok(item_ref.to_string());
        }
        let menu_item = self.resolve(item_ref, items)?;
        cart.latest_line_for(&menu_item.id)
            .map(str::to_string)
            .ok_or_else(|| MutationError::CartItemNotFound(item_ref.to_string()))
    }
}

/// Catalog price wins over a spoken adjustment; either way the price is never negative.
fn resolve_modifier(menu_item: &MenuItem, modifier: &ModifierArg) -> CartModifier {
    if let Some(known) = menu_item.modifier(modifier.name()) {
        if let Some(spoken) = modifier.price_adjustment()
            && spoken != known.price_cents
        {
            debug!(
                modifier = %known.name,
                spoken,
                catalog = known.price_cents,
                "Ignoring spoken price adjustment for catalog modifier"
            );
        }
        return CartModifier {
            name: known.name.clone(),
            price_cents: clamp_modifier_price(&known.name, known.price_cents),
        };
    }

    let name = modifier.name().trim().to_string();
    let price_cents = clamp_modifier_price(&name, modifier.price_adjustment().unwrap_or(0));
    CartModifier { name, price_cents }
}

// =============================================================================
// Worker
// =============================================================================

/// Callback receiving each mutation outcome, in application order.
pub type OutcomeCallback =
    Arc<dyn Fn(MutationOutcome) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Queue handle for submitting function calls to the worker.
#[derive(Clone)]
pub struct OrderGateHandle {
    tx: mpsc::UnboundedSender<PendingFunctionCall>,
}

impl OrderGateHandle {
    pub fn submit(&self, call: PendingFunctionCall) -> MutationResult<()> {
        self.tx.send(call).map_err(|_| MutationError::GateClosed)
    }
}

/// Drains queued function calls one at a time.
pub struct OrderGateWorker;

impl OrderGateWorker {
    /// Spawn the worker. It stops when `cancel` fires or every handle is dropped.
    pub fn spawn(
        gate: OrderMutationGate,
        on_outcome: OutcomeCallback,
        cancel: CancellationToken,
    ) -> (OrderGateHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingFunctionCall>();

        let task = tokio::spawn(async move {
            loop {
                let mut call = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(call) => call,
                        None => break,
                    },
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = gate.execute(&mut call) => result,
                };

                if let Err(e) = &result {
                    warn!(call_id = %call.call_id, name = %call.name, error = %e, "Function call failed");
                }
                on_outcome(MutationOutcome { call, result }).await;
            }
            debug!("Order gate worker stopped");
        });

        (OrderGateHandle { tx }, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::order::menu::{MenuModifier, StaticMenu};

    fn menu() -> Arc<dyn MenuCatalog> {
        Arc::new(StaticMenu::new(vec![
            MenuItem {
                id: "greek-bowl".to_string(),
                name: "Greek Bowl".to_string(),
                price_cents: 1295,
                aliases: vec![],
                modifiers: vec![
                    MenuModifier {
                        name: "no feta".to_string(),
                        price_cents: 0,
                    },
                    MenuModifier {
                        name: "extra feta".to_string(),
                        price_cents: 150,
                    },
                ],
                available: true,
            },
            MenuItem {
                id: "fries".to_string(),
                name: "French Fries".to_string(),
                price_cents: 450,
                aliases: vec!["fries".to_string()],
                modifiers: vec![],
                available: true,
            },
        ]))
    }

    fn gate() -> OrderMutationGate {
        OrderMutationGate::new(menu(), OrderGateConfig::default())
    }

    #[tokio::test]
    async fn test_add_item_clamps_quantity() {
        let gate = gate();
        let cart = gate.add_item("fries", 0, None, &[]).await.unwrap();
        assert_eq!(cart.items()[0].quantity, 1);

        let cart = gate.add_item("fries", 500, None, &[]).await.unwrap();
        assert_eq!(cart.items()[1].quantity, 100);
    }

    #[tokio::test]
    async fn test_negative_price_adjustment_clamped() {
        let gate = gate();
        let modifier = ModifierArg::Detailed {
            name: "light sauce".to_string(),
            price_adjustment: Some(-500),
        };
        let cart = gate.add_item("Greek Bowl", 1, None, &[modifier]).await.unwrap();
        let line = &cart.items()[0];
        assert_eq!(line.modifiers[0].price_cents, 0);
        assert_eq!(line.line_total_cents(), 1295);
    }

    #[tokio::test]
    async fn test_catalog_modifier_price_wins() {
        let gate = gate();
        let modifier = ModifierArg::Detailed {
            name: "Extra Feta".to_string(),
            price_adjustment: Some(10),
        };
        let cart = gate.add_item("greek-bowl", 1, None, &[modifier]).await.unwrap();
        assert_eq!(cart.items()[0].modifiers[0].name, "extra feta");
        assert_eq!(cart.items()[0].modifiers[0].price_cents, 150);
    }

    #[tokio::test]
    async fn test_notes_truncated() {
        let gate = gate();
        let notes = "x".repeat(1500);
        let cart = gate.add_item("fries", 1, Some(&notes), &[]).await.unwrap();
        assert_eq!(cart.items()[0].notes.as_ref().unwrap().chars().count(), 1000);
    }

    #[tokio::test]
    async fn test_remove_and_update_by_menu_reference() {
        let gate = gate();
        gate.add_item("fries", 1, None, &[]).await.unwrap();
        gate.add_item("greek bowl", 1, None, &[]).await.unwrap();

        let cart = gate.update_quantity("french fries", 3).await.unwrap();
        assert_eq!(cart.items()[0].quantity, 3);

        let cart = gate.remove_item("line-2").await.unwrap();
        assert_eq!(cart.items().len(), 1);

        let err = gate.remove_item("greek bowl").await.unwrap_err();
        assert_eq!(err, MutationError::CartItemNotFound("greek bowl".to_string()));
    }

    #[tokio::test]
    async fn test_apply_modifier_replaces_same_name() {
        let gate = gate();
        gate.add_item("greek bowl", 1, None, &[]).await.unwrap();
        gate.apply_modifier("line-1", &ModifierArg::Name("extra feta".to_string()))
            .await
            .unwrap();
        let cart = gate
            .apply_modifier("greek bowl", &ModifierArg::Name("EXTRA FETA".to_string()))
            .await
            .unwrap();
        assert_eq!(cart.items()[0].modifiers.len(), 1);
        assert_eq!(cart.subtotal_cents(), 1295 + 150);
    }

    #[tokio::test]
    async fn test_unknown_item_requests_clarification() {
        let gate = gate();
        let err = gate.add_item("lobster thermidor", 1, None, &[]).await.unwrap_err();
        assert!(err.needs_clarification());
        assert!(gate.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_is_fatal() {
        let gate = gate();
        let _held = gate.cart.lock().await;
        let err = gate.snapshot().await.unwrap_err();
        assert_eq!(err, MutationError::LockTimeout { waited_ms: 5000 });
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_tool_name() {
        let gate = gate();
        let mut call = PendingFunctionCall::new(
            "call_1",
            "add_to_order",
            r#"{"id":"fries","quantity":2,"notes":"extra crispy"}"#,
        );
        let cart = gate.execute(&mut call).await.unwrap();
        assert!(call.mutex_acquired_at.is_some());
        assert_eq!(cart.items()[0].quantity, 2);
        assert_eq!(cart.items()[0].notes.as_deref(), Some("extra crispy"));

        let mut call = PendingFunctionCall::new("call_2", "clear_order", "{}");
        assert!(gate.execute(&mut call).await.unwrap().is_empty());
    }

    #[test]
    fn test_outcome_output_json() {
        let outcome = MutationOutcome {
            call: PendingFunctionCall::new("call_1", "add_to_order", "{}"),
            result: Err(MutationError::MenuItemNotFound {
                query: "fahjeeta".to_string(),
                suggestion: Some("Chicken Fajita".to_string()),
            }),
        };
        let value: serde_json::Value = serde_json::from_str(&outcome.output_json()).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["needs_clarification"], true);
        assert_eq!(value["suggestion"], "Chicken Fajita");

        let outcome = MutationOutcome {
            call: PendingFunctionCall::new("call_2", "clear_order", "{}"),
            result: Ok(Cart::new()),
        };
        let value: serde_json::Value = serde_json::from_str(&outcome.output_json()).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["cart"]["subtotal_cents"], 0);
    }

    #[tokio::test]
    async fn test_worker_applies_calls_in_order() {
        let gate = gate();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let on_outcome: OutcomeCallback = Arc::new(move |outcome| {
            let tx = outcome_tx.clone();
            Box::pin(async move {
                let _ = tx.send(outcome);
            })
        });
        let cancel = CancellationToken::new();
        let (handle, task) = OrderGateWorker::spawn(gate.clone(), on_outcome, cancel.clone());

        handle
            .submit(PendingFunctionCall::new("a", "add_to_order", r#"{"id":"fries","quantity":1}"#))
            .unwrap();
        handle
            .submit(PendingFunctionCall::new("b", "add_to_order", r#"{"id":"greek bowl","quantity":1}"#))
            .unwrap();

        let first = outcome_rx.recv().await.unwrap();
        let second = outcome_rx.recv().await.unwrap();
        assert_eq!(first.call.call_id, "a");
        assert_eq!(second.call.call_id, "b");
        assert_eq!(first.result.unwrap().items().len(), 1);
        assert_eq!(second.result.unwrap().items().len(), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(
            handle.submit(PendingFunctionCall::new("c", "clear_order", "{}")),
            Err(MutationError::GateClosed)
        );
    }
}
