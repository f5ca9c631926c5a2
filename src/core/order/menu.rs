//! Menu catalog seam.
//!
//! The catalog itself lives outside the session; the gate only reads it.
//! [`StaticMenu`] serves a catalog loaded from YAML.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::errors::{MutationError, MutationResult};

/// A modifier offered for a menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuModifier {
    pub name: String,
    #[serde(default)]
    pub price_cents: i64,
}

/// An orderable menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    /// Alternative spoken names for this item
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub modifiers: Vec<MenuModifier>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl MenuItem {
    /// Catalog modifier matching `name`, ignoring case.
    pub fn modifier(&self, name: &str) -> Option<&MenuModifier> {
        self.modifiers
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name.trim()))
    }
}

/// Read-only menu source.
#[async_trait]
pub trait MenuCatalog: Send + Sync {
    /// All orderable items.
    async fn items(&self) -> MutationResult<Arc<[MenuItem]>>;
}

/// Catalog held in memory.
#[derive(Debug, Clone)]
pub struct StaticMenu {
    items: Arc<[MenuItem]>,
}

#[derive(Deserialize)]
struct MenuFile {
    items: Vec<MenuItem>,
}

impl StaticMenu {
    pub fn new(items: Vec<MenuItem>) -> Self {
        Self { items: items.into() }
    }

    /// Parse a catalog from YAML with a top-level `items` list.
    pub fn from_yaml_str(yaml: &str) -> MutationResult<Self> {
        let file: MenuFile = serde_yaml::from_str(yaml)
            .map_err(|e| MutationError::Catalog(format!("invalid menu YAML: {e}")))?;
        Ok(Self::new(file.items))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MutationResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MutationError::Catalog(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }
}

#[async_trait]
impl MenuCatalog for StaticMenu {
    async fn items(&self) -> MutationResult<Arc<[MenuItem]>> {
        Ok(self.items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MENU: &str = r#"
items:
  - id: greek-bowl
    name: Greek Bowl
    price_cents: 1295
    modifiers:
      - name: no feta
      - name: extra feta
        price_cents: 150
  - id: espresso
    name: Espresso
    price_cents: 350
    aliases: [shot of espresso]
    available: false
"#;

    #[tokio::test]
    async fn test_static_menu_from_yaml() {
        let menu = StaticMenu::from_yaml_str(MENU).unwrap();
        let items = menu.items().await.unwrap();
        assert_eq!(items.len(), 2);

        let bowl = &items[0];
        assert!(bowl.available);
        assert_eq!(bowl.modifier("No Feta").unwrap().price_cents, 0);
        assert_eq!(bowl.modifier("extra feta").unwrap().price_cents, 150);
        assert!(bowl.modifier("olives").is_none());

        assert!(!items[1].available);
        assert_eq!(items[1].aliases, vec!["shot of espresso".to_string()]);
    }

    #[test]
    fn test_invalid_yaml_is_catalog_error() {
        let err = StaticMenu::from_yaml_str("items: 5").unwrap_err();
        assert!(matches!(err, MutationError::Catalog(_)));
    }
}
