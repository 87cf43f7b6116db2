//! Voxform host entry point.
//!
//! ```text
//! voxform <events.jsonl> [input.wav | mic] [output.wav]
//! ```
//!
//! Replays a scripted session against the tissue-sample form, streams the
//! input audio (a WAV file, the microphone, or silence), renders synthesized
//! audio into `output.wav`, and prints the final form as JSON.

mod form;
mod replay;
mod settings;
mod wav;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use voxform_core::{
    spawn_renderer, ConversationOrchestrator, MicCapture, OrchestratorState, PlaybackQueue,
};

use form::{FormStore, TissueSampleDescriptor};
use replay::ReplaySession;
use settings::{default_settings_path, load_settings, save_settings};

/// How long to let the renderer finish queued audio after the run ends.
const PLAYBACK_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

enum AudioInput {
    Silence,
    Mic,
    Wav(PathBuf),
}

struct Args {
    events: PathBuf,
    input: AudioInput,
    output: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut it = std::env::args().skip(1);
    let events = match it.next().as_deref() {
        Some("--help" | "-h") | None => {
            println!("Usage: voxform <events.jsonl> [input.wav | mic] [output.wav]");
            std::process::exit(0);
        }
        Some(path) => PathBuf::from(path),
    };
    let input = match it.next() {
        None => AudioInput::Silence,
        Some(arg) if arg == "mic" => AudioInput::Mic,
        Some(arg) => AudioInput::Wav(PathBuf::from(arg)),
    };
    let output = it.next().map(PathBuf::from);
    if let Some(extra) = it.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(Args {
        events,
        input,
        output,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxform=info")),
        )
        .init();

    let args = parse_args().map_err(anyhow::Error::msg)?;

    let settings_path = default_settings_path();
    let first_run = !settings_path.exists();
    let mut settings = load_settings(&settings_path);
    if first_run {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!("could not write default settings to {}: {e}", settings_path.display());
        }
    }
    settings.apply_env_overrides();
    let config = settings.orchestrator_config();
    info!(voice = %config.voice, threshold = config.turn_detection.threshold, "settings loaded");

    let replay = ReplaySession::load(&args.events)?;
    info!(steps = replay.steps(), "event script loaded");

    let store = FormStore::default();
    let playback = Arc::new(PlaybackQueue::new());
    let orchestrator = {
        let store = store.clone();
        Arc::new(ConversationOrchestrator::new(
            config.clone(),
            Arc::new(replay),
            Arc::clone(&playback),
            move |form: TissueSampleDescriptor| {
                info!(case_id = %form.case_id, "form updated by the model");
                store.replace(form);
            },
        )?)
    };
    let handle = orchestrator.handle();
    handle.set_muted(settings.start_muted);

    // ── Forward status and messages to the log ─────────────────────────────
    let mut status_rx = orchestrator.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match event.state {
                    OrchestratorState::Failed => {
                        warn!(seq = event.seq, detail = ?event.detail, "status")
                    }
                    state => info!(seq = event.seq, ?state, detail = ?event.detail, "status"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let mut message_rx = orchestrator.subscribe_messages();
    tokio::spawn(async move {
        loop {
            match message_rx.recv().await {
                Ok(message) => info!(seq = message.seq, text = %message.text, "assistant"),
                Err(RecvError::Lagged(n)) => warn!("message receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── Playback renderer ──────────────────────────────────────────────────
    let render_cancel = CancellationToken::new();
    let renderer = match &args.output {
        Some(path) => {
            let sink = wav::WavPlaybackSink::create(path, config.sample_rate)?;
            Some(spawn_renderer(
                Arc::clone(&playback),
                sink,
                render_cancel.clone(),
            ))
        }
        None => None,
    };

    // ── Audio source ───────────────────────────────────────────────────────
    let mut _capture = None;
    let audio = match &args.input {
        AudioInput::Silence => wav::silence(config.sample_rate, config.frame_samples),
        AudioInput::Wav(path) => wav::paced(wav::read_blocks(
            path,
            config.sample_rate,
            config.frame_samples,
        )?),
        AudioInput::Mic => {
            let mut capture_config = config.capture_config();
            capture_config.preferred_device = settings.preferred_input_device.clone();
            let (capture, blocks) = MicCapture::start(capture_config)
                .await
                .context("opening microphone")?;
            _capture = Some(capture);
            blocks
        }
    };

    let cancel = CancellationToken::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; ending conversation");
                handle.cancel();
            }
        });
    }

    let outcome = orchestrator.run(audio, cancel).await?;
    if let Some(e) = &outcome.error {
        warn!(stage = e.stage(), "conversation ended early: {e}");
    }

    if renderer.is_some() {
        let deadline = tokio::time::Instant::now() + PLAYBACK_DRAIN_TIMEOUT;
        while !playback.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
    render_cancel.cancel();
    if let Some(renderer) = renderer {
        renderer.await?.finalize()?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "form": store.snapshot(),
            "diagnostics": outcome.diagnostics,
        }))?
    );
    Ok(())
}
