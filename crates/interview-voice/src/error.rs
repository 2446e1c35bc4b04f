//! Error types for the interview voice system

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice interview
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Microphone access was refused. Terminal; the user has to retry.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Speech recognition or synthesis is not available on this host. Terminal.
    #[error("Speech capability missing: {0}")]
    CapabilityMissing(String),

    /// No usable input device.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// `start()` was called while another session is still running.
    #[error("An interview session is already active")]
    SessionActive,

    /// The session was ended (e.g. `end()` raced with `start()`).
    #[error("Interview session ended")]
    SessionEnded,

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    /// Dialogue generation failed. Surfaced once, never retried automatically.
    #[error("Dialogue backend error: {0}")]
    Dialogue(String),

    #[error("Dialogue backend rate limited: {0}")]
    RateLimited(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected realtime event. Logged and ignored by the session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Terminal errors end the session; nothing retries them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_)
                | VoiceError::CapabilityMissing(_)
                | VoiceError::DeviceUnavailable(_)
        )
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable(err.to_string())
            }
            other => {
                let text = other.to_string();
                if looks_like_permission_error(&text) {
                    VoiceError::PermissionDenied(text)
                } else {
                    VoiceError::AudioStream(text)
                }
            }
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

/// Host audio backends report access problems as free-form text.
pub(crate) fn looks_like_permission_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(VoiceError::PermissionDenied("no".into()).is_terminal());
        assert!(VoiceError::CapabilityMissing("tts".into()).is_terminal());
        assert!(!VoiceError::Dialogue("500".into()).is_terminal());
        assert!(!VoiceError::Transport("reset".into()).is_terminal());
    }

    #[test]
    fn permission_text_detection() {
        assert!(looks_like_permission_error("Access DENIED by user"));
        assert!(!looks_like_permission_error("buffer underrun"));
    }
}
