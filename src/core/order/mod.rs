//! Order state: cart, menu resolution and the mutation gate.

pub mod cart;
pub mod gate;
pub mod matcher;
pub mod menu;
pub mod tools;

pub use cart::{Cart, CartItem, CartModifier, MAX_LINE_QUANTITY, OrderLimits};
pub use gate::{
    MutationOutcome, OrderGateConfig, OrderGateHandle, OrderGateWorker, OrderMutationGate,
    OutcomeCallback, PendingFunctionCall,
};
pub use matcher::{MatchKind, MatcherConfig, MenuMatch, resolve};
pub use menu::{MenuCatalog, MenuItem, MenuModifier, StaticMenu};
pub use tools::{ModifierArg, OrderCommand, order_tools};
