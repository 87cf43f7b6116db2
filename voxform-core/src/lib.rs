//! # voxform-core
//!
//! Realtime voice form-filling SDK: the user talks, a remote conversational
//! model listens and fills a structured record through a tool call, and a
//! human can edit the same record at any time.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicCapture → SampleBlock stream → AudioFramer → session.send_audio
//!
//! session events ─► ConversationOrchestrator (one ordered loop)
//!                      ├─ PlaybackQueue ──► renderer (barge-in clears it)
//!                      ├─ ToolDispatcher ──► Save_ModelData ──► form record
//!                      └─ broadcast::Sender<StatusEvent / MessageEvent>
//!
//! human edit ─► OrchestratorHandle ─► ModelSyncBridge ─► session.add_item
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod sync;
pub mod tools;

// Convenience re-exports for downstream crates
pub use audio::{AudioFrame, AudioFramer, CaptureConfig, MicCapture, MuteGate, SampleStream};
pub use buffering::chunk::SampleBlock;
pub use engine::{
    ConversationOrchestrator, DiagnosticsSnapshot, OrchestratorConfig, OrchestratorHandle,
    RunOutcome,
};
pub use error::{Result, VoxformError};
pub use ipc::events::{MessageEvent, OrchestratorState, StatusEvent};
pub use playback::{spawn_renderer, PlaybackChunk, PlaybackQueue, PlaybackSink};
pub use session::{
    ConversationEvent, ConversationItem, RealtimeSession, ScriptStep, ScriptedSessionFactory,
    SessionConfig, SessionFactory,
};
pub use sync::ModelSyncBridge;
pub use tools::{typed_tool, ToolDefinition, ToolRegistry, SAVE_MODEL_DATA};
