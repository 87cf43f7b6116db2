//! Event types the orchestrator publishes to its host.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `StatusEvent` | `ConversationOrchestrator::subscribe_status` |
//! | `MessageEvent` | `ConversationOrchestrator::subscribe_messages` |

use serde::{Deserialize, Serialize};

/// Emitted whenever the orchestrator's state or surfaced status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: OrchestratorState,
    /// Human-readable status line ("Connected", "Speech started", error text).
    pub detail: Option<String>,
}

/// One assistant message, flushed when a response finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub seq: u64,
    pub text: String,
}

/// Lifecycle of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    /// No run started yet.
    Disconnected,
    /// Opening the remote session.
    Connecting,
    /// Sending instructions, voice, turn detection and tools.
    Configuring,
    /// Streaming audio, consuming events, dispatching tools.
    Active,
    /// Run ended normally or was cancelled; may run again.
    Terminated,
    /// Connect or configure failed.
    Failed,
}

impl OrchestratorState {
    /// `true` once a run has ended, either way.
    pub fn is_finished(self) -> bool {
        matches!(self, OrchestratorState::Terminated | OrchestratorState::Failed)
    }
}
