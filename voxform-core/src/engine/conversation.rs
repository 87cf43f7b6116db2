//! The `Active` phase of a run: the ordered event loop and the audio egress
//! task, both owned by one `ActiveConversation`.
//!
//! ## Per-event flow
//!
//! ```text
//! events.next() ─► interpret (status, playback, output buffer)
//!              └─► tool handling (dispatch once per item id, follow-up response)
//! edits.recv()  ─► ModelSyncBridge (only genuine human edits reach the model)
//! ```
//!
//! The session is held here and nowhere else; it is closed and dropped when
//! the loop ends.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures::stream::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{AudioFramer, MuteGate, SampleStream},
    engine::Publisher,
    error::VoxformError,
    playback::PlaybackQueue,
    session::{ConversationEvent, RealtimeSession},
    sync::ModelSyncBridge,
    tools::{ToolActivity, ToolDispatcher, ToolRegistry},
};

/// How long teardown waits for the audio task after cancelling it.
const AUDIO_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Per-run counters, shared with the audio task.
#[derive(Default)]
pub struct RunDiagnostics {
    pub events_received: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub playback_chunks: AtomicUsize,
    pub barge_ins: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub tool_errors: AtomicUsize,
    pub duplicate_tool_calls: AtomicUsize,
    pub responses_requested: AtomicUsize,
    pub sync_messages: AtomicUsize,
}

impl RunDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            playback_chunks: self.playback_chunks.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_errors: self.tool_errors.load(Ordering::Relaxed),
            duplicate_tool_calls: self.duplicate_tool_calls.load(Ordering::Relaxed),
            responses_requested: self.responses_requested.load(Ordering::Relaxed),
            sync_messages: self.sync_messages.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 9] {
        [
            &self.events_received,
            &self.frames_sent,
            &self.playback_chunks,
            &self.barge_ins,
            &self.tool_calls,
            &self.tool_errors,
            &self.duplicate_tool_calls,
            &self.responses_requested,
            &self.sync_messages,
        ]
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub events_received: usize,
    pub frames_sent: usize,
    pub playback_chunks: usize,
    pub barge_ins: usize,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub duplicate_tool_calls: usize,
    pub responses_requested: usize,
    pub sync_messages: usize,
}

/// Everything the active phase borrows from the orchestrator.
pub(crate) struct ActiveContext {
    pub publisher: Publisher,
    pub playback: Arc<PlaybackQueue>,
    pub diagnostics: Arc<RunDiagnostics>,
    pub bridge: ModelSyncBridge,
    pub registry: Arc<ToolRegistry>,
    pub gate: MuteGate,
}

enum Step<M> {
    Cancelled,
    Event(Option<crate::error::Result<ConversationEvent>>),
    Edit(M),
}

/// One configured session in the `Active` state.
pub(crate) struct ActiveConversation {
    session: Arc<dyn RealtimeSession>,
    ctx: ActiveContext,
    dispatcher: ToolDispatcher,
    output: String,
    audio: Option<SampleStream>,
    audio_task: Option<JoinHandle<()>>,
    audio_failure: Arc<Mutex<Option<VoxformError>>>,
}

impl ActiveConversation {
    pub fn new(session: Box<dyn RealtimeSession>, ctx: ActiveContext, audio: SampleStream) -> Self {
        let dispatcher = ToolDispatcher::new(Arc::clone(&ctx.registry));
        Self {
            session: Arc::from(session),
            ctx,
            dispatcher,
            output: String::new(),
            audio: Some(audio),
            audio_task: None,
            audio_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Consume events and edits until the stream ends, fails, or `cancel`
    /// fires. Returns the error that ended the run, if any.
    pub async fn run<M>(
        mut self,
        edits: &mut mpsc::Receiver<M>,
        cancel: CancellationToken,
    ) -> Option<VoxformError>
    where
        M: Serialize + Send + Sync + 'static,
    {
        let mut failure = match self.session.receive_events() {
            Ok(mut events) => loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    event = events.next() => Step::Event(event),
                    Some(edit) = edits.recv() => Step::Edit(edit),
                };

                match step {
                    Step::Cancelled => {
                        info!("conversation cancelled");
                        break None;
                    }
                    Step::Event(None) => {
                        info!("event stream ended");
                        break None;
                    }
                    Step::Event(Some(Err(e))) => {
                        error!(error = %e, "event stream failed");
                        break Some(e);
                    }
                    Step::Event(Some(Ok(event))) => {
                        bump(&self.ctx.diagnostics.events_received);
                        debug!(kind = event.kind(), "event");
                        self.interpret(&event, &cancel);
                        if let Err(e) = self.handle_tools(&event).await {
                            if !self.session.is_usable() {
                                error!(error = %e, "session unusable after tool handling");
                                break Some(e);
                            }
                            warn!(error = %e, "tool result could not be delivered");
                        }
                    }
                    Step::Edit(model) => {
                        if let Err(e) = self.sync_edit(&model).await {
                            if !self.session.is_usable() {
                                error!(error = %e, "session unusable after model sync");
                                break Some(e);
                            }
                            warn!(error = %e, "model sync failed");
                        }
                    }
                }
            },
            Err(e) => {
                error!(error = %e, "could not take event stream");
                Some(e)
            }
        };

        self.shutdown(&cancel).await;
        if failure.is_none() {
            failure = self.audio_failure.lock().take();
        }
        failure
    }

    /// Primary action for one event.
    fn interpret(&mut self, event: &ConversationEvent, cancel: &CancellationToken) {
        match event {
            ConversationEvent::SessionStarted { session_id } => {
                info!(session_id = session_id.as_deref().unwrap_or("-"), "session started");
                self.ctx.publisher.status("Connected");
                self.start_audio(cancel);
            }
            ConversationEvent::InputSpeechStarted { .. } => {
                let discarded = self.ctx.playback.clear();
                bump(&self.ctx.diagnostics.barge_ins);
                debug!(discarded, "barge-in");
                self.ctx.publisher.status("Speech started");
            }
            ConversationEvent::InputSpeechFinished { .. } => {
                self.ctx.publisher.status("Speech finished");
            }
            ConversationEvent::ItemStreamingDelta(delta) => {
                if let Some(audio) = &delta.audio {
                    if self.ctx.playback.enqueue(audio.clone()).is_some() {
                        bump(&self.ctx.diagnostics.playback_chunks);
                    }
                }
                if let Some(text) = delta.output_text() {
                    self.output.push_str(text);
                }
            }
            ConversationEvent::ItemStreamingFinished(_) => {}
            ConversationEvent::ResponseFinished(_) => {
                if !self.output.is_empty() {
                    let text = std::mem::take(&mut self.output);
                    self.ctx.publisher.message(text);
                }
            }
        }
    }

    async fn handle_tools(&mut self, event: &ConversationEvent) -> crate::error::Result<()> {
        let diagnostics = &self.ctx.diagnostics;
        match self.dispatcher.handle_event(event, self.session.as_ref()).await? {
            ToolActivity::Idle => {}
            ToolActivity::Dispatched(dispatched) => {
                bump(&diagnostics.tool_calls);
                if let Some(e) = dispatched.error {
                    bump(&diagnostics.tool_errors);
                    self.ctx.publisher.status(format!("Tool call failed: {e}"));
                }
            }
            ToolActivity::Duplicate { .. } => bump(&diagnostics.duplicate_tool_calls),
            ToolActivity::ResponseRequested => bump(&diagnostics.responses_requested),
        }
        Ok(())
    }

    async fn sync_edit<M>(&mut self, model: &M) -> crate::error::Result<()>
    where
        M: Serialize + Sync,
    {
        let sent = self
            .ctx
            .bridge
            .notify_external_edit(model, self.session.as_ref())
            .await?;
        if sent {
            bump(&self.ctx.diagnostics.sync_messages);
        }
        Ok(())
    }

    /// Spawn the audio egress task. Only the first call does anything.
    fn start_audio(&mut self, cancel: &CancellationToken) {
        let Some(blocks) = self.audio.take() else {
            return;
        };
        let diagnostics = Arc::clone(&self.ctx.diagnostics);
        let frames = AudioFramer::new(self.ctx.gate.clone())
            .into_frames(blocks)
            .inspect(move |_| bump(&diagnostics.frames_sent))
            .boxed();

        let session = Arc::clone(&self.session);
        let publisher = self.ctx.publisher.clone();
        let failure = Arc::clone(&self.audio_failure);
        let cancel = cancel.clone();
        info!("audio egress started");
        self.audio_task = Some(tokio::spawn(async move {
            match session.send_audio(frames, cancel.clone()).await {
                Ok(()) => debug!("audio egress finished"),
                Err(e) => {
                    warn!(error = %e, "audio egress failed");
                    publisher.status(format!("Audio stream failed: {e}"));
                    if !session.is_usable() {
                        *failure.lock() = Some(e);
                        cancel.cancel();
                    }
                }
            }
        }));
    }

    async fn shutdown(&mut self, cancel: &CancellationToken) {
        cancel.cancel();
        if let Some(mut task) = self.audio_task.take() {
            match tokio::time::timeout(AUDIO_SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "audio task panicked"),
                Err(_) => {
                    warn!("audio task ignored cancellation; aborting");
                    task.abort();
                }
            }
        }
        self.session.close().await;
        debug!("session closed");
    }
}
