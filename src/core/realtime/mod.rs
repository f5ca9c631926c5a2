//! Realtime model protocol.
//!
//! - `messages` - JSON frames exchanged on the data channel
//! - `router` - turns inbound frames into transitions, transcripts and cart mutations
//! - `flow` - outbound audio flow control

pub mod flow;
pub mod messages;
pub mod router;

pub use flow::{AudioFlowGate, FlowControlConfig};
pub use messages::{
    ApiError, ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig,
    ToolDef, TurnDetection,
};
pub use router::{
    RealtimeEventRouter, RouterConfig, RouterContext, TranscriptBuffer, TranscriptRole, TurnMode,
};
