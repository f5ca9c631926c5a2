pub mod order;
pub mod realtime;
pub mod reconnect;
pub mod session;
pub mod transport;

// Re-export commonly used types for convenience
pub use order::{
    Cart, CartItem, MenuCatalog, MenuItem, MutationOutcome, OrderGateConfig, OrderMutationGate,
    PendingFunctionCall, StaticMenu,
};

pub use realtime::{ClientEvent, RealtimeEventRouter, ServerEvent, TranscriptRole, TurnMode};

pub use reconnect::{ReconnectionConfig, ReconnectionEvent, ReconnectionSupervisor};

pub use session::{
    SessionEvent, SessionHandle, SessionOptions, SessionServices, SessionSnapshot, SessionState,
    SessionStateMachine, StateChange, StateEvent, StateTimeouts,
};

pub use transport::{
    EphemeralCredential, HttpTokenBroker, LoopbackFactory, LoopbackRemote, StaticTokenBroker,
    TokenBroker, TransportConnection, TransportEvent,
};
