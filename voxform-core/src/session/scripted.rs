//! `ScriptedSession` — in-process session that replays a fixed event script.
//!
//! Used by tests and by the replay host to drive the whole orchestrator
//! without a network connection. Every call the orchestrator makes is
//! recorded in a shared `SessionLog`.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audio::FrameStream;
use crate::error::{Result, VoxformError};
use crate::session::{
    ConversationEvent, ConversationItem, EventStream, RealtimeSession, SessionConfig,
    SessionFactory,
};

/// One step of a session script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(ConversationEvent),
    /// Pause before the next step.
    Delay(Duration),
    /// Fail the event stream with this message; nothing follows.
    Fail(String),
}

impl From<ConversationEvent> for ScriptStep {
    fn from(event: ConversationEvent) -> Self {
        ScriptStep::Event(event)
    }
}

/// Everything the orchestrator sent to the session.
#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    pub configs: Vec<SessionConfig>,
    pub items: Vec<ConversationItem>,
    pub responses_started: usize,
    pub frames_received: usize,
    pub audio_bytes: usize,
    pub closed: bool,
}

/// Factory handing out `ScriptedSession`s that share one log.
pub struct ScriptedSessionFactory {
    script: Vec<ScriptStep>,
    log: Arc<Mutex<SessionLog>>,
    fail_open: Option<String>,
    fail_configure: Option<String>,
    fail_audio: Option<String>,
    audio_failure_is_fatal: bool,
    hold_open: bool,
    opens: AtomicUsize,
}

impl ScriptedSessionFactory {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ScriptStep>,
    {
        Self {
            script: script.into_iter().map(Into::into).collect(),
            log: Arc::new(Mutex::new(SessionLog::default())),
            fail_open: None,
            fail_configure: None,
            fail_audio: None,
            audio_failure_is_fatal: false,
            hold_open: false,
            opens: AtomicUsize::new(0),
        }
    }

    /// Make `open` fail with a connect error.
    pub fn fail_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    /// Make `configure` fail with a configure error.
    pub fn fail_configure(mut self, reason: impl Into<String>) -> Self {
        self.fail_configure = Some(reason.into());
        self
    }

    /// Make `send_audio` fail. When `fatal`, the session also reports itself
    /// unusable afterwards.
    pub fn fail_audio(mut self, reason: impl Into<String>, fatal: bool) -> Self {
        self.fail_audio = Some(reason.into());
        self.audio_failure_is_fatal = fatal;
        self
    }

    /// Keep the event stream open after the script runs out, until the
    /// session is closed or the consumer stops polling.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<SessionLog>> {
        Arc::clone(&self.log)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn open(&self) -> Result<Box<dyn RealtimeSession>> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = &self.fail_open {
            return Err(VoxformError::Connect(reason.clone()));
        }
        Ok(Box::new(ScriptedSession {
            script: Mutex::new(Some(self.script.iter().cloned().collect())),
            log: Arc::clone(&self.log),
            fail_configure: self.fail_configure.clone(),
            fail_audio: self.fail_audio.clone(),
            audio_failure_is_fatal: self.audio_failure_is_fatal,
            hold_open: self.hold_open,
            closed: CancellationToken::new(),
            usable: Arc::new(AtomicBool::new(true)),
        }))
    }
}

pub struct ScriptedSession {
    script: Mutex<Option<VecDeque<ScriptStep>>>,
    log: Arc<Mutex<SessionLog>>,
    fail_configure: Option<String>,
    fail_audio: Option<String>,
    audio_failure_is_fatal: bool,
    hold_open: bool,
    closed: CancellationToken,
    usable: Arc<AtomicBool>,
}

impl ScriptedSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() || !self.usable.load(Ordering::Acquire) {
            return Err(VoxformError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeSession for ScriptedSession {
    async fn configure(&self, config: &SessionConfig) -> Result<()> {
        if let Some(reason) = &self.fail_configure {
            return Err(VoxformError::Configure(reason.clone()));
        }
        self.log.lock().configs.push(config.clone());
        Ok(())
    }

    fn receive_events(&self) -> Result<EventStream> {
        let steps = self
            .script
            .lock()
            .take()
            .ok_or_else(|| VoxformError::Stream("event stream already taken".into()))?;
        let hold_open = self.hold_open;
        let closed = self.closed.clone();
        let usable = Arc::clone(&self.usable);

        let stream = futures::stream::unfold(Some(steps), move |state| {
            let closed = closed.clone();
            let usable = Arc::clone(&usable);
            async move {
                let mut steps = state?;
                loop {
                    match steps.pop_front() {
                        Some(ScriptStep::Event(event)) => return Some((Ok(event), Some(steps))),
                        Some(ScriptStep::Delay(pause)) => tokio::time::sleep(pause).await,
                        Some(ScriptStep::Fail(reason)) => {
                            usable.store(false, Ordering::Release);
                            return Some((Err(VoxformError::Stream(reason)), None));
                        }
                        None => {
                            if hold_open {
                                closed.cancelled().await;
                            }
                            return None;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn send_audio(&self, mut frames: FrameStream, cancel: CancellationToken) -> Result<()> {
        if let Some(reason) = &self.fail_audio {
            if self.audio_failure_is_fatal {
                self.usable.store(false, Ordering::Release);
            }
            return Err(VoxformError::AudioStream(reason.clone()));
        }
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.closed.cancelled() => break,
                frame = frames.next() => frame,
            };
            let Some(frame) = frame else { break };
            let mut log = self.log.lock();
            log.frames_received += 1;
            log.audio_bytes += frame.len() * 2;
        }
        debug!("scripted session audio ended");
        Ok(())
    }

    async fn add_item(&self, item: ConversationItem) -> Result<()> {
        self.ensure_open()?;
        self.log.lock().items.push(item);
        Ok(())
    }

    async fn start_response(&self) -> Result<()> {
        self.ensure_open()?;
        self.log.lock().responses_started += 1;
        Ok(())
    }

    fn is_usable(&self) -> bool {
        !self.closed.is_cancelled() && self.usable.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.cancel();
        self.log.lock().closed = true;
    }
}
