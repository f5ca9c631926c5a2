//! Error taxonomy for the ordering session.
//!
//! Four families map onto the components that raise them:
//! - [`ConnectionError`]: transport, credentials, microphone
//! - [`ProtocolError`]: inbound frames the router cannot use
//! - [`MutationError`]: cart mutations and menu resolution
//! - [`StateError`]: undefined state machine edges
//!
//! [`SessionError`] wraps all of them for callers that drive a whole session.

use thiserror::Error;

use crate::core::session::state::{SessionState, StateEvent};

// =============================================================================
// Connection Errors
// =============================================================================

/// Errors raised by the transport, token broker and microphone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection was not live within the allotted time
    #[error("Connection timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// ICE negotiation or DTLS setup failed
    #[error("ICE negotiation failed: {0}")]
    IceFailed(String),

    /// SDP offer/answer exchange failed
    #[error("Signaling failed: {0}")]
    Signaling(String),

    /// Token broker could not issue a credential
    #[error("Credential unavailable: {0}")]
    Credential(String),

    /// Credential expired before it could be used
    #[error("Credential expired")]
    CredentialExpired,

    /// Microphone permission was refused
    #[error("Microphone access denied: {0}")]
    MicrophoneDenied(String),

    /// Microphone track ended or was revoked mid-session
    #[error("Microphone revoked: {0}")]
    MicrophoneRevoked(String),

    /// Operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    /// Sending on the peer failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reconnection budget exhausted
    #[error("Connection lost after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Result type for transport operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

// =============================================================================
// Protocol Errors
// =============================================================================

/// Errors raised while decoding inbound frames.
///
/// All of these are recovered locally: the frame is logged and dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not valid JSON or missed required fields
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame carried a `type` the router does not know
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Frame arrived in a state where it has no meaning
    #[error("Out-of-sequence frame '{frame}' in state {state}")]
    OutOfSequence { frame: String, state: SessionState },
}

/// Result type for frame decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// =============================================================================
// Mutation Errors
// =============================================================================

/// Errors raised by the order mutation gate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MutationError {
    /// Spoken item could not be matched with enough confidence
    #[error("Menu item not found: '{query}'")]
    MenuItemNotFound {
        query: String,
        /// Best candidate below the confidence threshold, if any
        suggestion: Option<String>,
    },

    /// Referenced cart line does not exist
    #[error("Cart item not found: '{0}'")]
    CartItemNotFound(String),

    /// Function call arguments could not be interpreted
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Function name is not one of the order tools
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Menu catalog lookup failed or timed out
    #[error("Menu catalog unavailable: {0}")]
    Catalog(String),

    /// Mutex could not be acquired in time (deadlock)
    #[error("Cart lock not acquired within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    /// The gate worker has shut down
    #[error("Order gate closed")]
    GateClosed,
}

impl MutationError {
    /// Whether the caller should ask the guest to clarify rather than fail.
    pub fn needs_clarification(&self) -> bool {
        matches!(
            self,
            MutationError::MenuItemNotFound { .. } | MutationError::CartItemNotFound(_)
        )
    }

    /// Whether this error tears down the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MutationError::LockTimeout { .. })
    }
}

/// Result type for cart mutations.
pub type MutationResult<T> = Result<T, MutationError>;

// =============================================================================
// State Errors
// =============================================================================

/// Errors raised by the session state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// No edge is defined for this event in the current state
    #[error("Invalid transition: {event:?} in state {from}")]
    InvalidTransition { from: SessionState, event: StateEvent },
}

/// Result type for state transitions.
pub type StateResult<T> = Result<T, StateError>;

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Environment variable has an invalid value
    #[error("Invalid value for {key}: {message}")]
    InvalidEnv { key: String, message: String },

    /// Configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Session Errors
// =============================================================================

/// Top-level error for a session.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    State(#[from] StateError),

    /// Session was stopped by the caller
    #[error("Session stopped")]
    Stopped,
}

impl SessionError {
    /// Fatal errors tear the session down instead of being surfaced and survived.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Mutation(e) => e.is_fatal(),
            SessionError::Connection(ConnectionError::ReconnectExhausted { .. }) => true,
            SessionError::State(_) => true,
            _ => false,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::Timeout { after_ms: 15000 };
        assert_eq!(err.to_string(), "Connection timed out after 15000ms");

        let err = ConnectionError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");

        let err = MutationError::MenuItemNotFound {
            query: "fahjeeta".to_string(),
            suggestion: Some("Chicken Fajita".to_string()),
        };
        assert!(err.to_string().contains("fahjeeta"));
    }

    #[test]
    fn test_mutation_error_classification() {
        assert!(MutationError::LockTimeout { waited_ms: 5000 }.is_fatal());
        assert!(!MutationError::GateClosed.is_fatal());

        let not_found = MutationError::MenuItemNotFound {
            query: "x".to_string(),
            suggestion: None,
        };
        assert!(not_found.needs_clarification());
        assert!(!not_found.is_fatal());
        assert!(!MutationError::InvalidArguments("bad".to_string()).needs_clarification());
    }

    #[test]
    fn test_session_error_fatality() {
        let err: SessionError = MutationError::LockTimeout { waited_ms: 1 }.into();
        assert!(err.is_fatal());

        let err: SessionError = ConnectionError::ReconnectExhausted { attempts: 5 }.into();
        assert!(err.is_fatal());

        let err: SessionError = ProtocolError::UnknownType("foo.bar".to_string()).into();
        assert!(!err.is_fatal());

        let err: SessionError = ConnectionError::MicrophoneRevoked("ended".to_string()).into();
        assert!(!err.is_fatal());
    }
}
