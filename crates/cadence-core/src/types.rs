//! Shared types for the cadence speech pipeline.
//!
//! Kept here so consumers can depend on status and config shapes without
//! pulling in tokio, rodio, or reqwest.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::voice::VoicePreferences;

// ─── Config ────────────────────────────────────────────────────────────────

/// Default stream-pause threshold. Tuned for Kokoro's first-audio latency.
pub const DEFAULT_PAUSE_THRESHOLD_MS: u64 = 250;

/// Speech pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub kokoro_url: String,
    /// Gap after the last token beyond which the stream counts as paused.
    pub pause_threshold_ms: u64,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub voice_preferences: VoicePreferences,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            kokoro_url: "http://localhost:8880".into(),
            pause_threshold_ms: DEFAULT_PAUSE_THRESHOLD_MS,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            voice_preferences: VoicePreferences::default(),
        }
    }
}

impl SpeechConfig {
    pub fn pause_threshold(&self) -> Duration {
        Duration::from_millis(self.pause_threshold_ms)
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| format!("invalid config: {e}"))
    }
}

// ─── Playback types ────────────────────────────────────────────────────────

/// Observable playback mode of the speech controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    Idle,
    Streaming,
    Flushing,
}

/// Speech status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechStatus {
    pub mode: PlaybackMode,
    /// An utterance is currently with the synthesis engine.
    pub speaking: bool,
    /// Characters received but not yet dispatched.
    pub pending_chars: usize,
    pub voice: Option<String>,
    pub utterances_spoken: u64,
}

impl Default for SpeechStatus {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::Idle,
            speaking: false,
            pending_chars: 0,
            voice: None,
            utterances_spoken: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = SpeechConfig::from_json_str(r#"{"pause_threshold_ms": 400}"#).unwrap();
        assert_eq!(config.pause_threshold(), Duration::from_millis(400));
        assert_eq!(config.kokoro_url, "http://localhost:8880");
        assert_eq!(config.voice_preferences, VoicePreferences::default());
    }

    #[test]
    fn invalid_config_is_an_error() {
        assert!(SpeechConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_value(SpeechStatus::default()).unwrap();
        assert_eq!(json["mode"], "idle");
        assert_eq!(json["pendingChars"], 0);
    }
}
