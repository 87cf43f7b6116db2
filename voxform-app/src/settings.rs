//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxform_core::session::{Modality, TurnDetection};
use voxform_core::OrchestratorConfig;

const KNOWN_VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub voice: String,
    pub vad_threshold: f32,
    pub silence_duration_ms: u32,
    pub model_description: String,
    /// Ask for text-only responses (no synthesized audio).
    pub text_only: bool,
    pub start_muted: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            voice: "alloy".into(),
            vad_threshold: 0.4,
            silence_duration_ms: 150,
            model_description: "tissue sample descriptor".into(),
            text_only: false,
            start_muted: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.voice = normalize_voice(&self.voice);
        self.vad_threshold = if self.vad_threshold.is_finite() {
            self.vad_threshold.clamp(0.0, 1.0)
        } else {
            0.4
        };
        self.silence_duration_ms = self.silence_duration_ms.min(5_000);
        self.model_description = self.model_description.trim().to_string();
        if self.model_description.is_empty() {
            self.model_description = "tissue sample descriptor".into();
        }
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Apply `VOXFORM_*` environment overrides, then re-normalize.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(voice) = std::env::var("VOXFORM_VOICE") {
            self.voice = voice;
        }
        if let Some(threshold) = env_parse::<f32>("VOXFORM_VAD_THRESHOLD") {
            self.vad_threshold = threshold;
        }
        if let Some(ms) = env_parse::<u32>("VOXFORM_SILENCE_MS") {
            self.silence_duration_ms = ms;
        }
        if let Ok(device) = std::env::var("VOXFORM_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
        if let Ok(flag) = std::env::var("VOXFORM_TEXT_ONLY") {
            self.text_only = matches!(flag.trim(), "1" | "true" | "yes");
        }
        self.normalize();
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            model_description: self.model_description.clone(),
            voice: self.voice.clone(),
            turn_detection: TurnDetection {
                threshold: self.vad_threshold,
                silence_duration_ms: self.silence_duration_ms,
            },
            modalities: if self.text_only {
                vec![Modality::Text]
            } else {
                vec![Modality::Audio, Modality::Text]
            },
            ..OrchestratorConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn normalize_voice(raw: &str) -> String {
    let voice = raw.trim().to_ascii_lowercase();
    if KNOWN_VOICES.contains(&voice.as_str()) {
        voice
    } else {
        "alloy".into()
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Voxform")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxform")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_ranges_and_unknown_voice() {
        let mut settings = AppSettings {
            voice: " Shimmer ".into(),
            vad_threshold: 3.0,
            silence_duration_ms: 60_000,
            preferred_input_device: Some("   ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.voice, "shimmer");
        assert_eq!(settings.vad_threshold, 1.0);
        assert_eq!(settings.silence_duration_ms, 5_000);
        assert_eq!(settings.preferred_input_device, None);

        settings.voice = "robot".into();
        settings.vad_threshold = f32::NAN;
        settings.normalize();
        assert_eq!(settings.voice, "alloy");
        assert_eq!(settings.vad_threshold, 0.4);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"voice":"echo","textOnly":true}"#).expect("write");

        let settings = load_settings(&path);
        assert_eq!(settings.voice, "echo");
        assert!(settings.text_only);
        assert_eq!(settings.silence_duration_ms, 150);
        assert_eq!(
            settings.orchestrator_config().modalities,
            vec![Modality::Text]
        );
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            vad_threshold: 0.55,
            start_muted: true,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings(&path), AppSettings::default());
        fs::write(&path, "{ nope").expect("write");
        assert_eq!(load_settings(&path), AppSettings::default());
    }
}
