//! Interview configuration. Load from TOML or env.
//!
//! Precedence: environment (`INTERVIEW__…`, `__` between nested keys) > file at
//! `INTERVIEW_CONFIG` (default `config/interview.toml`) > built-in defaults.

use crate::stt::RecognitionMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Opening question spoken when no static greeting is configured and the
/// dialogue backend cannot produce one.
pub const DEFAULT_OPENING_LINE: &str = "Hello! I'm your AI interviewer. I'll be asking you a few \
    questions about your background and experience. Let's begin. Can you tell me about yourself?";

pub const DEFAULT_CLOSING_LINE: &str = "Thank you for your time! We'll be in touch soon.";

pub const DEFAULT_FALLBACK_REPLY: &str = "I'm sorry, could you repeat that?";

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterviewConfig {
    /// Completed candidate answers before the closing line is spoken.
    pub max_turns: u32,
    /// Static greeting. When unset the dialogue backend writes the opening utterance.
    pub greeting: Option<String>,
    pub opening_line: String,
    pub closing_line: String,
    /// Spoken when the backend returns an empty reply.
    pub fallback_reply: String,
    /// Consecutive transient failures before the "connection unstable" notice.
    pub unstable_after: u32,
    pub backoff: BackoffConfig,
    pub capture: CaptureConfig,
    pub dialogue: DialogueConfig,
    pub speech: SpeechServiceConfig,
    pub transport: TransportConfig,
}

impl Default for InterviewConfig {
    fn default() -> Self {
        Self {
            max_turns: 7,
            greeting: None,
            opening_line: DEFAULT_OPENING_LINE.to_string(),
            closing_line: DEFAULT_CLOSING_LINE.to_string(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            unstable_after: 5,
            backoff: BackoffConfig::default(),
            capture: CaptureConfig::default(),
            dialogue: DialogueConfig::default(),
            speech: SpeechServiceConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

/// Microphone capture and recognition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub mode: RecognitionMode,
    /// Sample rate in Hz (8000/16000/32000/48000 for WebRTC VAD).
    pub sample_rate: u32,
    /// Samples per chunk (480 = 30ms at 16kHz).
    pub chunk_size: usize,
    /// Live mode: silence window after which a listen attempt reports "no speech".
    pub capture_window_ms: u64,
    /// Buffered mode: clip length recorded before each decode.
    pub clip_ms: u64,
    /// Silence after speech that closes an utterance.
    pub gap_ms: u64,
    /// Shorter utterances are dropped.
    pub min_speech_ms: u64,
    /// Hard cap on one utterance.
    pub max_utterance_ms: u64,
    /// WebRTC VAD aggressiveness 0-3.
    pub vad_mode: u8,
    /// Live mode: decode the partial buffer this often for interim text. 0 disables.
    pub partial_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: RecognitionMode::Live,
            sample_rate: 16000,
            chunk_size: 480,
            capture_window_ms: 5000,
            clip_ms: 5000,
            gap_ms: 800,
            min_speech_ms: 200,
            max_utterance_ms: 30_000,
            vad_mode: 2,
            partial_interval_ms: 0,
        }
    }
}

impl CaptureConfig {
    pub fn capture_window(&self) -> Duration {
        Duration::from_millis(self.capture_window_ms)
    }

    pub fn clip_duration(&self) -> Duration {
        Duration::from_millis(self.clip_ms)
    }

    pub fn partial_interval(&self) -> Option<Duration> {
        (self.partial_interval_ms > 0).then(|| Duration::from_millis(self.partial_interval_ms))
    }
}

/// OpenAI-compatible chat completion endpoint used to generate questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Base URL without trailing slash.
    pub api_url: String,
    /// Falls back to `DIALOGUE_API_KEY` / `OPENAI_API_KEY` / `OPENROUTER_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 150,
            timeout_secs: 30,
        }
    }
}

impl DialogueConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(
            self.api_key.as_deref(),
            &["DIALOGUE_API_KEY", "OPENAI_API_KEY", "OPENROUTER_API_KEY"],
        )
    }
}

/// Remote speech services (transcription + synthesis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechServiceConfig {
    pub api_url: String,
    /// Falls back to `STT_API_KEY` / `TTS_API_KEY` / `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub stt_model: String,
    pub tts_model: String,
    pub voice: String,
    /// Local Whisper model (requires the `whisper` feature).
    pub whisper_model_path: Option<String>,
}

impl Default for SpeechServiceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            whisper_model_path: None,
        }
    }
}

impl SpeechServiceConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(
            self.api_key.as_deref(),
            &["STT_API_KEY", "TTS_API_KEY", "OPENAI_API_KEY"],
        )
    }
}

/// Realtime transport (alternate mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub url: String,
    /// Falls back to `REALTIME_API_KEY` / `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// PCM16 rate used in both directions.
    pub sample_rate: u32,
    pub voice: String,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub temperature: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17"
                .to_string(),
            api_key: None,
            sample_rate: 24000,
            voice: "alloy".to_string(),
            vad_threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 1000,
            temperature: 0.8,
        }
    }
}

impl TransportConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), &["REALTIME_API_KEY", "OPENAI_API_KEY"])
    }
}

impl InterviewConfig {
    /// Load config from file and environment. Precedence: env > `INTERVIEW_CONFIG` path > `config/interview` > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("INTERVIEW_CONFIG").unwrap_or_else(|_| "config/interview".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file (missing file is fine) plus `INTERVIEW__` env overrides.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let path_str = path.to_string_lossy();
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&InterviewConfig::default())?)
            .add_source(config::File::with_name(&path_str).required(false))
            .add_source(
                config::Environment::with_prefix("INTERVIEW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: InterviewConfig = built.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.max_turns == 0 {
            return Err(config::ConfigError::Message(
                "max_turns must be at least 1".to_string(),
            ));
        }
        if !matches!(self.capture.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(config::ConfigError::Message(format!(
                "capture.sample_rate must be 8000, 16000, 32000 or 48000, got {}",
                self.capture.sample_rate
            )));
        }
        if self.capture.vad_mode > 3 {
            return Err(config::ConfigError::Message(format!(
                "capture.vad_mode must be 0-3, got {}",
                self.capture.vad_mode
            )));
        }
        if self.backoff.base_delay_ms == 0 {
            return Err(config::ConfigError::Message(
                "backoff.base_delay_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Explicit value first, then the listed env vars; blank values are treated as unset.
fn resolve_api_key(explicit: Option<&str>, env_names: &[&str]) -> Option<String> {
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(env_names.iter().filter_map(|name| std::env::var(name).ok()))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
