//! Session configuration sent once, right after the session opens.

use serde::{Deserialize, Serialize};

use crate::tools::ToolSpec;

/// Server-side voice-activity turn detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnDetection {
    /// VAD activation threshold in [0, 1].
    pub threshold: f32,
    /// Trailing silence that ends a user turn.
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.4,
            silence_duration_ms: 150,
        }
    }
}

/// Output kinds the remote model may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub instructions: String,
    pub voice: String,
    pub turn_detection: TurnDetection,
    pub modalities: Vec<Modality>,
    pub tools: Vec<ToolSpec>,
}
