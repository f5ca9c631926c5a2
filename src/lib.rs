pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use config::AppConfig;
pub use core::*;
pub use errors::{
    ConfigError, ConnectionError, MutationError, ProtocolError, SessionError, SessionResult,
    StateError,
};
