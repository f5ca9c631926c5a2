//! Order tools advertised to the model and their argument parsing.

use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::core::realtime::messages::ToolDef;
use crate::errors::{MutationError, MutationResult};

pub const ADD_TO_ORDER: &str = "add_to_order";
pub const REMOVE_FROM_ORDER: &str = "remove_from_order";
pub const UPDATE_ITEM_QUANTITY: &str = "update_item_quantity";
pub const APPLY_MODIFIER: &str = "apply_modifier";
pub const CLEAR_ORDER: &str = "clear_order";

/// A modifier as spoken: a bare name or a name with a price adjustment in cents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ModifierArg {
    Name(String),
    Detailed {
        name: String,
        #[serde(default, deserialize_with = "lenient_cents")]
        price_adjustment: Option<i64>,
    },
}

impl ModifierArg {
    pub fn name(&self) -> &str {
        match self {
            ModifierArg::Name(name) => name,
            ModifierArg::Detailed { name, .. } => name,
        }
    }

    pub fn price_adjustment(&self) -> Option<i64> {
        match self {
            ModifierArg::Name(_) => None,
            ModifierArg::Detailed {
                price_adjustment, ..
            } => *price_adjustment,
        }
    }
}

fn default_quantity() -> i64 {
    1
}

/// Any JSON number as an integer: fractions round, out-of-range values
/// saturate. Range checks happen later, where they clamp.
fn saturating_int(number: &serde_json::Number) -> i64 {
    if let Some(value) = number.as_i64() {
        value
    } else if number.is_u64() {
        i64::MAX
    } else {
        // float-to-int `as` saturates
        number.as_f64().map_or(0, |value| value.round() as i64)
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    serde_json::Number::deserialize(deserializer).map(|number| saturating_int(&number))
}

fn lenient_cents<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Option::<serde_json::Number>::deserialize(deserializer)
        .map(|number| number.as_ref().map(saturating_int))
}

/// Arguments of `add_to_order`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddItemArgs {
    /// Menu item id or spoken name
    #[serde(alias = "name", alias = "item")]
    pub id: String,
    #[serde(default = "default_quantity", deserialize_with = "lenient_int")]
    pub quantity: i64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<ModifierArg>,
}

#[derive(Deserialize)]
struct ItemRefArgs {
    #[serde(alias = "id", alias = "name")]
    item_id: String,
}

#[derive(Deserialize)]
struct QuantityArgs {
    #[serde(alias = "id", alias = "name")]
    item_id: String,
    #[serde(deserialize_with = "lenient_int")]
    quantity: i64,
}

#[derive(Deserialize)]
struct ModifierArgs {
    #[serde(alias = "id", alias = "name")]
    item_id: String,
    modifier: ModifierArg,
}

/// A parsed order tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCommand {
    Add(AddItemArgs),
    /// `item_ref` is a cart line id or a menu reference
    Remove { item_ref: String },
    UpdateQuantity { item_ref: String, quantity: i64 },
    ApplyModifier { item_ref: String, modifier: ModifierArg },
    Clear,
}

impl OrderCommand {
    /// Parse a tool call by name and raw JSON arguments.
    pub fn parse(name: &str, arguments: &str) -> MutationResult<Self> {
        let arguments = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };

        match name {
            ADD_TO_ORDER => Ok(OrderCommand::Add(parse_args(name, arguments)?)),
            REMOVE_FROM_ORDER => {
                let args: ItemRefArgs = parse_args(name, arguments)?;
                Ok(OrderCommand::Remove {
                    item_ref: args.item_id,
                })
            }
            UPDATE_ITEM_QUANTITY => {
                let args: QuantityArgs = parse_args(name, arguments)?;
                Ok(OrderCommand::UpdateQuantity {
                    item_ref: args.item_id,
                    quantity: args.quantity,
                })
            }
            APPLY_MODIFIER => {
                let args: ModifierArgs = parse_args(name, arguments)?;
                Ok(OrderCommand::ApplyModifier {
                    item_ref: args.item_id,
                    modifier: args.modifier,
                })
            }
            CLEAR_ORDER => Ok(OrderCommand::Clear),
            other => Err(MutationError::UnknownFunction(other.to_string())),
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(name: &str, arguments: &str) -> MutationResult<T> {
    serde_json::from_str(arguments)
        .map_err(|e| MutationError::InvalidArguments(format!("{name}: {e}")))
}

fn modifier_schema() -> serde_json::Value {
    json!({
        "oneOf": [
            { "type": "string" },
            {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "price_adjustment": {
                        "type": "integer",
                        "description": "Price change in cents"
                    }
                },
                "required": ["name"]
            }
        ]
    })
}

/// Tool definitions for the order gate.
pub fn order_tools() -> Vec<ToolDef> {
    vec![
        ToolDef::function(
            ADD_TO_ORDER,
            "Add a menu item to the guest's order.",
            json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": "string",
                        "description": "Menu item name or id as the guest said it"
                    },
                    "quantity": { "type": "integer", "minimum": 1, "maximum": 100 },
                    "notes": { "type": "string" },
                    "modifiers": { "type": "array", "items": modifier_schema() }
                },
                "required": ["id", "quantity"]
            }),
        ),
        ToolDef::function(
            REMOVE_FROM_ORDER,
            "Remove an item from the order.",
            json!({
                "type": "object",
                "properties": {
                    "item_id": {
                        "type": "string",
                        "description": "Cart line id or menu item name"
                    }
                },
                "required": ["item_id"]
            }),
        ),
        ToolDef::function(
            UPDATE_ITEM_QUANTITY,
            "Change the quantity of an item already in the order.",
            json!({
                "type": "object",
                "properties": {
                    "item_id": { "type": "string" },
                    "quantity": { "type": "integer", "minimum": 1, "maximum": 100 }
                },
                "required": ["item_id", "quantity"]
            }),
        ),
        ToolDef::function(
            APPLY_MODIFIER,
            "Apply a modifier to an item already in the order.",
            json!({
                "type": "object",
                "properties": {
                    "item_id": { "type": "string" },
                    "modifier": modifier_schema()
                },
                "required": ["item_id", "modifier"]
            }),
        ),
        ToolDef::function(
            CLEAR_ORDER,
            "Remove every item from the order.",
            json!({ "type": "object", "properties": {} }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_with_mixed_modifiers() {
        let command = OrderCommand::parse(
            ADD_TO_ORDER,
            r#"{"id":"Greek Bowl","quantity":1,"modifiers":["no feta",{"name":"extra olives","price_adjustment":-500}]}"#,
        )
        .unwrap();

        let OrderCommand::Add(args) = command else {
            panic!("expected add command");
        };
        assert_eq!(args.id, "Greek Bowl");
        assert_eq!(args.modifiers.len(), 2);
        assert_eq!(args.modifiers[0], ModifierArg::Name("no feta".to_string()));
        assert_eq!(args.modifiers[1].name(), "extra olives");
        assert_eq!(args.modifiers[1].price_adjustment(), Some(-500));
    }

    #[test]
    fn test_parse_add_defaults_quantity() {
        let command = OrderCommand::parse(ADD_TO_ORDER, r#"{"name":"fries"}"#).unwrap();
        let OrderCommand::Add(args) = command else {
            panic!("expected add command");
        };
        assert_eq!(args.quantity, 1);
        assert!(args.notes.is_none());
    }

    #[test]
    fn test_out_of_range_numbers_saturate() {
        let quantity = |arguments: &str| match OrderCommand::parse(ADD_TO_ORDER, arguments) {
            Ok(OrderCommand::Add(args)) => args.quantity,
            other => panic!("expected add command, got {other:?}"),
        };
        assert_eq!(quantity(r#"{"id":"fries","quantity":1e20}"#), i64::MAX);
        assert_eq!(quantity(r#"{"id":"fries","quantity":-1e20}"#), i64::MIN);
        assert_eq!(quantity(r#"{"id":"fries","quantity":18446744073709551615}"#), i64::MAX);
        assert_eq!(quantity(r#"{"id":"fries","quantity":2.0}"#), 2);
        assert_eq!(quantity(r#"{"id":"fries","quantity":2.6}"#), 3);

        let Ok(OrderCommand::Add(args)) = OrderCommand::parse(
            ADD_TO_ORDER,
            r#"{"id":"fries","modifiers":[{"name":"coupon","price_adjustment":-500.0},{"name":"sauce","price_adjustment":null}]}"#,
        ) else {
            panic!("expected add command");
        };
        assert_eq!(args.modifiers[0].price_adjustment(), Some(-500));
        assert_eq!(args.modifiers[1].price_adjustment(), None);

        assert_eq!(
            OrderCommand::parse(UPDATE_ITEM_QUANTITY, r#"{"item_id":"fries","quantity":3.0}"#).unwrap(),
            OrderCommand::UpdateQuantity {
                item_ref: "fries".to_string(),
                quantity: 3
            }
        );
        assert!(matches!(
            OrderCommand::parse(ADD_TO_ORDER, r#"{"id":"fries","quantity":"two"}"#),
            Err(MutationError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_parse_other_tools() {
        assert_eq!(
            OrderCommand::parse(REMOVE_FROM_ORDER, r#"{"item_id":"line-1"}"#).unwrap(),
            OrderCommand::Remove {
                item_ref: "line-1".to_string()
            }
        );
        assert_eq!(
            OrderCommand::parse(UPDATE_ITEM_QUANTITY, r#"{"item_id":"fries","quantity":0}"#).unwrap(),
            OrderCommand::UpdateQuantity {
                item_ref: "fries".to_string(),
                quantity: 0
            }
        );
        assert_eq!(OrderCommand::parse(CLEAR_ORDER, "").unwrap(), OrderCommand::Clear);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            OrderCommand::parse(ADD_TO_ORDER, r#"{"quantity":2}"#),
            Err(MutationError::InvalidArguments(_))
        ));
        assert!(matches!(
            OrderCommand::parse(ADD_TO_ORDER, "{not json"),
            Err(MutationError::InvalidArguments(_))
        ));
        assert_eq!(
            OrderCommand::parse("book_table", "{}"),
            Err(MutationError::UnknownFunction("book_table".to_string()))
        );
    }

    #[test]
    fn test_order_tools_schema() {
        let tools = order_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![ADD_TO_ORDER, REMOVE_FROM_ORDER, UPDATE_ITEM_QUANTITY, APPLY_MODIFIER, CLEAR_ORDER]
        );
        assert!(tools.iter().all(|t| t.tool_type == "function"));
    }
}
