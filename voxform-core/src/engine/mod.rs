//! `ConversationOrchestrator` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ConversationOrchestrator::new()
//!     └─► run()
//!         ├─► Connecting    factory.open()         ── error ─► Failed
//!         ├─► Configuring   session.configure()    ── error ─► Failed
//!         ├─► Active        event loop + audio task
//!         └─► Terminated    stream ended, stream error, or cancel
//! ```
//!
//! `run()` is exclusive: a second concurrent call returns
//! `VoxformError::AlreadyRunning`. After `Terminated` or `Failed` the
//! orchestrator may run again with a fresh session.
//!
//! ## Threading
//!
//! The event loop runs on the caller's task. The audio egress task is
//! spawned on the first `SessionStarted` and shares the session through an
//! `Arc`. Both stop on the run's `CancellationToken`, which is a child of
//! the token passed to `run()`.

pub mod conversation;
pub mod instructions;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use anyhow::anyhow;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    audio::{CaptureConfig, MuteGate, SampleStream},
    error::{Result, VoxformError},
    ipc::events::{MessageEvent, OrchestratorState, StatusEvent},
    playback::PlaybackQueue,
    session::{Modality, SessionConfig, SessionFactory, TurnDetection},
    sync::ModelSyncBridge,
    tools::{save_model_data_tool, schema_value, ToolDefinition, ToolRegistry},
};

pub use conversation::{DiagnosticsSnapshot, RunDiagnostics};
pub use instructions::build_instructions;

use conversation::{ActiveContext, ActiveConversation};

/// Broadcast channel capacity for status and message events.
const BROADCAST_CAP: usize = 256;

/// Human edits buffered between the UI and the event loop.
const EDIT_QUEUE_CAP: usize = 16;

/// Configuration for `ConversationOrchestrator`.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// What the form record represents, e.g. "tissue sample descriptor".
    pub model_description: String,
    /// Output voice id. Default: "alloy".
    pub voice: String,
    /// Server VAD. Default: threshold 0.4, 150 ms trailing silence.
    pub turn_detection: TurnDetection,
    /// Rate of the audio source and of outbound frames (Hz). Default: 24000.
    pub sample_rate: u32,
    /// Samples per outbound frame. Default: 4096.
    pub frame_samples: usize,
    /// Default: audio and text.
    pub modalities: Vec<Modality>,
    /// Replaces the generated form-filling instructions when set.
    pub instructions: Option<String>,
    pub edit_queue_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model_description: "form".into(),
            voice: "alloy".into(),
            turn_detection: TurnDetection::default(),
            sample_rate: 24_000,
            frame_samples: 4_096,
            modalities: vec![Modality::Audio, Modality::Text],
            instructions: None,
            edit_queue_capacity: EDIT_QUEUE_CAP,
            broadcast_capacity: BROADCAST_CAP,
        }
    }
}

impl OrchestratorConfig {
    /// Microphone settings matching the session's audio format.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            target_sample_rate: self.sample_rate,
            block_samples: self.frame_samples,
            ..CaptureConfig::default()
        }
    }
}

/// What a finished run reports back.
#[derive(Debug)]
pub struct RunOutcome {
    /// Always `Terminated` for a run that reached `Active`.
    pub state: OrchestratorState,
    /// Stream or audio error that ended the run early.
    pub error: Option<VoxformError>,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Publishes state changes and messages. Shared with the audio task.
#[derive(Clone)]
pub(crate) struct Publisher {
    state: Arc<Mutex<OrchestratorState>>,
    status_tx: broadcast::Sender<StatusEvent>,
    message_tx: broadcast::Sender<MessageEvent>,
    seq: Arc<AtomicU64>,
}

impl Publisher {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_state(&self, state: OrchestratorState, detail: Option<String>) {
        *self.state.lock() = state;
        let _ = self.status_tx.send(StatusEvent {
            seq: self.next_seq(),
            state,
            detail,
        });
    }

    /// Surface a status line without changing state.
    pub fn status(&self, detail: impl Into<String>) {
        let state = *self.state.lock();
        let _ = self.status_tx.send(StatusEvent {
            seq: self.next_seq(),
            state,
            detail: Some(detail.into()),
        });
    }

    pub fn message(&self, text: String) {
        let _ = self.message_tx.send(MessageEvent {
            seq: self.next_seq(),
            text,
        });
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }
}

/// Drives one conversation at a time for a form record of type `M`.
///
/// `ConversationOrchestrator` is `Send + Sync`; wrap it in `Arc` to run it on
/// one task while a UI holds an `OrchestratorHandle`.
pub struct ConversationOrchestrator<M> {
    config: OrchestratorConfig,
    factory: Arc<dyn SessionFactory>,
    registry: Arc<ToolRegistry>,
    playback: Arc<PlaybackQueue>,
    bridge: ModelSyncBridge,
    instructions: String,
    gate: MuteGate,
    /// `true` while `run()` is in progress.
    running: AtomicBool,
    publisher: Publisher,
    edits_tx: mpsc::Sender<M>,
    edits_rx: tokio::sync::Mutex<mpsc::Receiver<M>>,
    run_cancel: Arc<Mutex<Option<CancellationToken>>>,
    diagnostics: Arc<RunDiagnostics>,
}

impl<M> ConversationOrchestrator<M>
where
    M: Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static,
{
    /// Build an orchestrator whose `Save_ModelData` tool hands every model
    /// update to `on_update`.
    pub fn new<F>(
        config: OrchestratorConfig,
        factory: Arc<dyn SessionFactory>,
        playback: Arc<PlaybackQueue>,
        on_update: F,
    ) -> Result<Self>
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        let bridge = ModelSyncBridge::new();
        let recorder = bridge.clone();
        let save = save_model_data_tool::<M, _>(move |model| {
            recorder.record_applied(&model)?;
            on_update(model);
            Ok(())
        })?;
        let mut registry = ToolRegistry::new();
        registry.register(save)?;

        let instructions = match &config.instructions {
            Some(text) => text.clone(),
            None => build_instructions(&config.model_description, &schema_value::<M>()?),
        };

        let (status_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (message_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (edits_tx, edits_rx) = mpsc::channel(config.edit_queue_capacity.max(1));

        Ok(Self {
            config,
            factory,
            registry: Arc::new(registry),
            playback,
            bridge,
            instructions,
            gate: MuteGate::new(),
            running: AtomicBool::new(false),
            publisher: Publisher {
                state: Arc::new(Mutex::new(OrchestratorState::Disconnected)),
                status_tx,
                message_tx,
                seq: Arc::new(AtomicU64::new(0)),
            },
            edits_tx,
            edits_rx: tokio::sync::Mutex::new(edits_rx),
            run_cancel: Arc::new(Mutex::new(None)),
            diagnostics: Arc::new(RunDiagnostics::default()),
        })
    }

    /// Register an extra tool alongside `Save_ModelData`.
    ///
    /// # Errors
    /// - `VoxformError::AlreadyRunning` while a run is in progress.
    /// - `VoxformError::Other` when the name is taken.
    pub fn with_tool(mut self, tool: ToolDefinition) -> Result<Self> {
        if self.running.load(Ordering::SeqCst) {
            return Err(VoxformError::AlreadyRunning);
        }
        Arc::make_mut(&mut self.registry).register(tool)?;
        Ok(self)
    }

    /// The configuration sent to each new session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instructions: self.instructions.clone(),
            voice: self.config.voice.clone(),
            turn_detection: self.config.turn_detection,
            modalities: self.config.modalities.clone(),
            tools: self.registry.specs(),
        }
    }

    /// Run one conversation until the event stream ends or `cancel` fires.
    ///
    /// `audio` must yield mono blocks at `config.sample_rate`; it is framed
    /// and sent once the session reports `SessionStarted`.
    ///
    /// # Errors
    /// - `VoxformError::AlreadyRunning` if a run is in progress.
    /// - `VoxformError::Connect` / `VoxformError::Configure`; state is `Failed`.
    ///
    /// Errors after the session became active end the run in `Terminated`
    /// and come back in `RunOutcome::error`.
    pub async fn run(&self, audio: SampleStream, cancel: CancellationToken) -> Result<RunOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VoxformError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let token = cancel.child_token();
        *self.run_cancel.lock() = Some(token.clone());
        self.diagnostics.reset();
        self.bridge.reset();

        let result = self
            .run_inner(audio, token)
            .instrument(info_span!("conversation"))
            .await;

        *self.run_cancel.lock() = None;
        result
    }

    async fn run_inner(&self, audio: SampleStream, token: CancellationToken) -> Result<RunOutcome> {
        let mut edits = self.edits_rx.lock().await;
        let mut stale = 0usize;
        while edits.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            info!(stale, "dropped edits queued while no session was open");
        }

        // ── Connecting ──────────────────────────────────────────────────────
        self.publisher
            .set_state(OrchestratorState::Connecting, Some("Connecting...".into()));
        info!("opening session");
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.factory.open() => Some(opened),
        };
        let session = match opened {
            None => return Ok(self.finish(None)),
            Some(Ok(session)) => session,
            Some(Err(e)) => return Err(self.fail(e)),
        };

        // ── Configuring ─────────────────────────────────────────────────────
        self.publisher.set_state(
            OrchestratorState::Configuring,
            Some("Session started, configuring...".into()),
        );
        if let Err(e) = session.configure(&self.session_config()).await {
            session.close().await;
            return Err(self.fail(e));
        }

        // ── Active ──────────────────────────────────────────────────────────
        self.publisher.set_state(
            OrchestratorState::Active,
            Some("Configuration complete!".into()),
        );
        info!(voice = %self.config.voice, tools = self.registry.len(), "session active");

        let active = ActiveConversation::new(
            session,
            ActiveContext {
                publisher: self.publisher.clone(),
                playback: Arc::clone(&self.playback),
                diagnostics: Arc::clone(&self.diagnostics),
                bridge: self.bridge.clone(),
                registry: Arc::clone(&self.registry),
                gate: self.gate.clone(),
            },
            audio,
        );
        let failure = active.run(&mut edits, token).await;
        Ok(self.finish(failure))
    }

    fn fail(&self, e: VoxformError) -> VoxformError {
        error!(stage = e.stage(), error = %e, "conversation failed");
        self.publisher.set_state(
            OrchestratorState::Failed,
            Some(format!("Connection failed: {e}")),
        );
        e
    }

    fn finish(&self, error: Option<VoxformError>) -> RunOutcome {
        let detail = error.as_ref().map(|e| e.to_string());
        self.publisher.set_state(OrchestratorState::Terminated, detail);

        let snap = self.diagnostics.snapshot();
        info!(
            events_received = snap.events_received,
            frames_sent = snap.frames_sent,
            playback_chunks = snap.playback_chunks,
            barge_ins = snap.barge_ins,
            tool_calls = snap.tool_calls,
            tool_errors = snap.tool_errors,
            duplicate_tool_calls = snap.duplicate_tool_calls,
            responses_requested = snap.responses_requested,
            sync_messages = snap.sync_messages,
            "conversation ended: diagnostics"
        );
        RunOutcome {
            state: OrchestratorState::Terminated,
            error,
            diagnostics: snap,
        }
    }

    /// Cloneable control surface for UIs.
    pub fn handle(&self) -> OrchestratorHandle<M> {
        OrchestratorHandle {
            edits_tx: self.edits_tx.clone(),
            gate: self.gate.clone(),
            run_cancel: Arc::clone(&self.run_cancel),
            state: Arc::clone(&self.publisher.state),
        }
    }

    /// Current state (snapshot).
    pub fn state(&self) -> OrchestratorState {
        self.publisher.state()
    }

    /// Subscribe to state and status-line changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.publisher.status_tx.subscribe()
    }

    /// Subscribe to flushed assistant messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageEvent> {
        self.publisher.message_tx.subscribe()
    }

    /// Counters of the current or most recent run.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn playback(&self) -> &Arc<PlaybackQueue> {
        &self.playback
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Control surface handed to the UI layer.
pub struct OrchestratorHandle<M> {
    edits_tx: mpsc::Sender<M>,
    gate: MuteGate,
    run_cancel: Arc<Mutex<Option<CancellationToken>>>,
    state: Arc<Mutex<OrchestratorState>>,
}

impl<M> Clone for OrchestratorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            edits_tx: self.edits_tx.clone(),
            gate: self.gate.clone(),
            run_cancel: Arc::clone(&self.run_cancel),
            state: Arc::clone(&self.state),
        }
    }
}

impl<M> OrchestratorHandle<M> {
    /// Report a human edit of the form. Forwarded to the model only if it
    /// differs from what the model last saw.
    ///
    /// # Errors
    /// - `VoxformError::SessionClosed` once the orchestrator is gone.
    /// - `VoxformError::Other` when the edit queue is full.
    pub fn set_model_data(&self, model: M) -> Result<()> {
        match self.edits_tx.try_send(model) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(VoxformError::SessionClosed),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("edit queue full; dropping edit");
                Err(anyhow!("edit queue full").into())
            }
        }
    }

    /// Mute or unmute the microphone. Muted audio is sent as silence.
    pub fn set_muted(&self, muted: bool) {
        self.gate.set_muted(muted);
        info!(muted, "microphone gate changed");
    }

    pub fn is_muted(&self) -> bool {
        self.gate.is_muted()
    }

    /// End the current run, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.run_cancel.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn status(&self) -> OrchestratorState {
        *self.state.lock()
    }
}
