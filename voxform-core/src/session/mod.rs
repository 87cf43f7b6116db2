//! Remote realtime session abstraction.
//!
//! The wire protocol is not modelled here. `SessionFactory` and
//! `RealtimeSession` capture only the operations the orchestrator needs;
//! a websocket client, a WebRTC bridge, or the `ScriptedSession` replay all
//! plug in behind them.

pub mod config;
pub mod events;
pub mod scripted;

pub use config::{Modality, SessionConfig, TurnDetection};
pub use events::{
    ConversationEvent, ConversationItem, CreatedItem, ItemFinished, ResponseSummary,
    StreamingDelta,
};
pub use scripted::{ScriptStep, ScriptedSession, ScriptedSessionFactory, SessionLog};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::audio::FrameStream;
use crate::error::Result;

/// Inbound event sequence. Ends on remote close; an `Err` item means the
/// stream failed and no further events follow.
pub type EventStream = BoxStream<'static, Result<ConversationEvent>>;

/// Opens sessions. Failures surface as `VoxformError::Connect`.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RealtimeSession>>;
}

/// One live conversation with the remote model.
///
/// Methods take `&self` so the event loop and the audio task can share the
/// session behind an `Arc`.
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    /// Apply instructions, voice, turn detection and tools.
    /// Failures surface as `VoxformError::Configure`.
    async fn configure(&self, config: &SessionConfig) -> Result<()>;

    /// Take the inbound event stream. Not restartable: a second call fails.
    fn receive_events(&self) -> Result<EventStream>;

    /// Stream outbound audio until the frames run out or `cancel` fires.
    async fn send_audio(&self, frames: FrameStream, cancel: CancellationToken) -> Result<()>;

    /// Add an item to the conversation context.
    async fn add_item(&self, item: ConversationItem) -> Result<()>;

    /// Ask the model to produce a response now.
    async fn start_response(&self) -> Result<()>;

    /// `false` once the underlying connection can no longer carry traffic.
    fn is_usable(&self) -> bool {
        true
    }

    /// Release the connection. Called once when the run ends.
    async fn close(&self) {}
}
