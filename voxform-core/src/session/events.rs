//! Inbound conversation events and outbound conversation items.
//!
//! The event set is closed: adding a kind means updating every `match` over
//! it. Payloads derive serde so scripted sessions can be written as JSONL.

use serde::{Deserialize, Serialize};

/// One event emitted by the remote session, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// The remote session is ready; audio may start flowing.
    SessionStarted {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Server-side VAD heard the user start talking.
    InputSpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },
    /// Server-side VAD decided the user stopped talking.
    InputSpeechFinished {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },
    /// A piece of a streaming output item.
    ItemStreamingDelta(StreamingDelta),
    /// An output item finished streaming; may carry a tool call.
    ItemStreamingFinished(ItemFinished),
    /// A response turn finished.
    ResponseFinished(ResponseSummary),
}

impl ConversationEvent {
    /// Stable name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationEvent::SessionStarted { .. } => "session_started",
            ConversationEvent::InputSpeechStarted { .. } => "input_speech_started",
            ConversationEvent::InputSpeechFinished { .. } => "input_speech_finished",
            ConversationEvent::ItemStreamingDelta(_) => "item_streaming_delta",
            ConversationEvent::ItemStreamingFinished(_) => "item_streaming_finished",
            ConversationEvent::ResponseFinished(_) => "response_finished",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingDelta {
    pub item_id: String,
    pub text: Option<String>,
    /// Synthesized PCM16 audio bytes.
    pub audio: Option<Vec<u8>>,
    pub audio_transcript: Option<String>,
}

impl StreamingDelta {
    /// Text to append to the output buffer: the text part, else the audio transcript.
    pub fn output_text(&self) -> Option<&str> {
        self.text.as_deref().or(self.audio_transcript.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemFinished {
    pub item_id: String,
    pub function_name: Option<String>,
    pub call_id: Option<String>,
    /// Raw JSON text of the tool arguments.
    pub arguments: Option<String>,
}

impl ItemFinished {
    /// Tool name, when this item is a tool call.
    pub fn tool_name(&self) -> Option<&str> {
        self.function_name.as_deref().filter(|n| !n.is_empty())
    }

    /// Id the tool output must reference: the call id, else the item id.
    pub fn output_call_id(&self) -> &str {
        self.call_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.item_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseSummary {
    pub response_id: Option<String>,
    pub created_items: Vec<CreatedItem>,
}

impl ResponseSummary {
    pub fn has_tool_calls(&self) -> bool {
        self.created_items.iter().any(CreatedItem::is_tool_call)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatedItem {
    pub item_id: String,
    pub function_name: Option<String>,
}

impl CreatedItem {
    pub fn is_tool_call(&self) -> bool {
        self.function_name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Items the orchestrator injects into the conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    /// A user-role text message.
    UserMessage { text: String },
    /// The result of a tool call, reported back to the model.
    FunctionCallOutput { call_id: String, output: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse_from_tagged_json() {
        let raw = r#"{"type":"item_streaming_finished","item_id":"it-1","function_name":"Save_ModelData","arguments":"{\"caseId\":\"X1\"}"}"#;
        let event: ConversationEvent = serde_json::from_str(raw).expect("parse event");
        let ConversationEvent::ItemStreamingFinished(finished) = &event else {
            panic!("wrong kind: {}", event.kind());
        };
        assert_eq!(finished.tool_name(), Some("Save_ModelData"));
        assert_eq!(finished.output_call_id(), "it-1");

        let started: ConversationEvent =
            serde_json::from_str(r#"{"type":"session_started"}"#).expect("parse started");
        assert_eq!(started, ConversationEvent::SessionStarted { session_id: None });
    }

    #[test]
    fn empty_function_name_is_not_a_tool_call() {
        let finished = ItemFinished {
            item_id: "it-2".into(),
            function_name: Some(String::new()),
            ..ItemFinished::default()
        };
        assert_eq!(finished.tool_name(), None);

        let summary = ResponseSummary {
            response_id: None,
            created_items: vec![
                CreatedItem {
                    item_id: "a".into(),
                    function_name: Some(String::new()),
                },
                CreatedItem {
                    item_id: "b".into(),
                    function_name: None,
                },
            ],
        };
        assert!(!summary.has_tool_calls());
    }

    #[test]
    fn delta_prefers_text_over_transcript() {
        let delta = StreamingDelta {
            text: Some("OK".into()),
            audio_transcript: Some("okay".into()),
            ..StreamingDelta::default()
        };
        assert_eq!(delta.output_text(), Some("OK"));

        let delta = StreamingDelta {
            audio_transcript: Some("okay".into()),
            ..StreamingDelta::default()
        };
        assert_eq!(delta.output_text(), Some("okay"));
    }

    #[test]
    fn call_id_takes_precedence_for_tool_output() {
        let finished = ItemFinished {
            item_id: "item".into(),
            call_id: Some("call_9".into()),
            ..ItemFinished::default()
        };
        assert_eq!(finished.output_call_id(), "call_9");
    }
}
