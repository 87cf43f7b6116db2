//! `ReplaySession` — a session factory fed from a JSON-lines event file.
//!
//! Each non-empty line is one step:
//!
//! ```text
//! {"type":"session_started"}
//! {"type":"item_streaming_delta","item_id":"o1","text":"OK","audio":"<base64 pcm16>"}
//! {"type":"delay","ms":250}
//! {"type":"fail","reason":"socket reset"}
//! ```
//!
//! Lines starting with `#` are comments.

use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use std::time::Duration;
use voxform_core::session::{ConversationEvent, RealtimeSession, ScriptStep, SessionFactory};
use voxform_core::ScriptedSessionFactory;

pub struct ReplaySession {
    steps: usize,
    factory: ScriptedSessionFactory,
}

impl ReplaySession {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading event script {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let steps = raw
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(n, line)| parse_step(line).with_context(|| format!("event script line {n}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            steps: steps.len(),
            factory: ScriptedSessionFactory::new(steps),
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[async_trait]
impl SessionFactory for ReplaySession {
    async fn open(&self) -> voxform_core::Result<Box<dyn RealtimeSession>> {
        self.factory.open().await
    }
}

fn parse_step(line: &str) -> anyhow::Result<ScriptStep> {
    let mut value: Value = serde_json::from_str(line)?;
    match value.get("type").and_then(Value::as_str) {
        Some("delay") => {
            let ms = value
                .get("ms")
                .and_then(Value::as_u64)
                .context("delay needs an integer `ms`")?;
            Ok(ScriptStep::Delay(Duration::from_millis(ms)))
        }
        Some("fail") => {
            let reason = value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("scripted failure");
            Ok(ScriptStep::Fail(reason.to_string()))
        }
        Some(_) => {
            decode_audio(&mut value)?;
            let event: ConversationEvent = serde_json::from_value(value)?;
            Ok(ScriptStep::Event(event))
        }
        None => bail!("missing `type`"),
    }
}

/// Replace a base64 `audio` string with the byte array the event expects.
fn decode_audio(value: &mut Value) -> anyhow::Result<()> {
    let Some(audio) = value.get_mut("audio") else {
        return Ok(());
    };
    if let Value::String(encoded) = audio {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .context("audio is not valid base64")?;
        *audio = Value::Array(bytes.into_iter().map(Value::from).collect());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn parses_events_directives_and_comments() {
        let script = r#"
# opening
{"type":"session_started"}
{"type":"delay","ms":10}
{"type":"item_streaming_delta","item_id":"o1","text":"OK","audio":"AQID"}
{"type":"fail","reason":"reset"}
"#;
        let replay = ReplaySession::parse(script).expect("parse");
        assert_eq!(replay.steps(), 4);
    }

    #[test]
    fn bad_line_reports_its_number() {
        let err = ReplaySession::parse("{\"type\":\"session_started\"}\n{\"nope\":1}")
            .err()
            .expect("should fail");
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[tokio::test]
    async fn audio_is_decoded_from_base64() {
        let replay = ReplaySession::parse(
            r#"{"type":"item_streaming_delta","item_id":"o1","audio":"AQID"}"#,
        )
        .expect("parse");
        let session = replay.open().await.expect("open");
        let events: Vec<_> = session.receive_events().expect("events").collect().await;
        let Ok(ConversationEvent::ItemStreamingDelta(delta)) = &events[0] else {
            panic!("expected a delta");
        };
        assert_eq!(delta.audio.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
