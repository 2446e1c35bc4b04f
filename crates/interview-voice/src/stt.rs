//! **Speech-to-Text**: recognition fragments, the recognizer contract, and the
//! decode backends that turn buffered PCM into text.
//!
//! A [`SpeechRecognizer`] runs one capture window per `listen` call and reports
//! through a [`FragmentSink`]. It never restarts itself: the orchestrator decides
//! when to call `listen` again. Decode backends ([`SttBackend`]) are the
//! OpenAI-compatible transcription API, local Whisper (`whisper` feature), and a
//! placeholder.

use crate::config::SpeechServiceConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;
use tokio::sync::mpsc;

/// How the recognizer gets text out of the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    /// Continuous capture, VAD-segmented; interim + one final fragment per utterance.
    Live,
    /// Fixed-length clip, then one decode producing one final fragment.
    Buffered,
}

/// Partial or final recognized text. Only final fragments become messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionFragment {
    pub text: String,
    pub is_final: bool,
}

impl RecognitionFragment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Why a listen attempt ended without a final fragment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// Capture window elapsed in silence. Not an error: capture is simply restarted.
    #[error("no speech detected")]
    NoSpeechDetected,
    /// Network or service hiccup. Retried through the backoff controller.
    #[error("transient failure: {0}")]
    TransientFailure(String),
    /// Microphone access withdrawn mid-session. Terminal.
    #[error("microphone permission revoked")]
    PermissionRevoked,
    /// Microphone gone. Terminal.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl RecognitionError {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecognitionError::PermissionRevoked | RecognitionError::DeviceUnavailable(_)
        )
    }
}

/// Where a recognizer delivers fragments. Cloneable; sends after the listener
/// went away are silently dropped.
#[derive(Debug, Clone)]
pub struct FragmentSink {
    tx: mpsc::UnboundedSender<RecognitionFragment>,
}

impl FragmentSink {
    pub fn new(tx: mpsc::UnboundedSender<RecognitionFragment>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half, mostly for tests and adapters.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RecognitionFragment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn interim(&self, text: impl Into<String>) {
        let _ = self.tx.send(RecognitionFragment::interim(text));
    }

    pub fn final_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(RecognitionFragment::final_text(text));
    }

    pub fn send(&self, fragment: RecognitionFragment) {
        let _ = self.tx.send(fragment);
    }
}

/// One long-lived recognizer; `listen` is one capture window.
///
/// Returns `Ok(())` once a final fragment has been delivered to `sink`. Dropping
/// the returned future (task abort) must stop capture.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn mode(&self) -> RecognitionMode;

    async fn listen(&self, sink: FragmentSink) -> Result<(), RecognitionError>;
}

/// Backend for converting a PCM clip to text. Implement for local Whisper or remote STT.
pub trait SttBackend: Send + Sync {
    /// Transcribe mono f32 PCM at `sample_rate`; return empty string if nothing detected.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let data_len = samples.len() * 2;
    let header_len = 44u32;
    let file_len = header_len + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    buf.write_all(b"RIFF")?;
    buf.write_all(&(file_len - 8).to_le_bytes())?;
    buf.write_all(b"WAVE")?;
    buf.write_all(b"fmt ")?;
    buf.write_all(&16u32.to_le_bytes())?;
    buf.write_all(&1u16.to_le_bytes())?; // PCM
    buf.write_all(&1u16.to_le_bytes())?; // mono
    buf.write_all(&sample_rate.to_le_bytes())?;
    buf.write_all(&(sample_rate * 2).to_le_bytes())?; // byte rate
    buf.write_all(&2u16.to_le_bytes())?; // block align
    buf.write_all(&16u16.to_le_bytes())?; // bits per sample
    buf.write_all(b"data")?;
    buf.write_all(&(data_len as u32).to_le_bytes())?;
    for &s in samples {
        buf.write_all(&f32_to_i16(s).to_le_bytes())?;
    }
    Ok(buf)
}

pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Placeholder STT: returns a fixed string. Use for testing the loop without Whisper/API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl SttBackend for PlaceholderStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let secs = samples.len() as f32 / sample_rate.max(1) as f32;
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            samples.len(),
            secs
        ))
    }
}

/// OpenAI-compatible transcription API (`{api_url}/audio/transcriptions`).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(config: &SpeechServiceConfig) -> VoiceResult<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            VoiceError::Config("STT requires speech.api_key, STT_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        Self::new(config.api_url.clone(), api_key, config.stt_model.clone())
    }
}

impl SttBackend for OpenAiStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Offline decode with a local ggml Whisper model. Audio must be 16 kHz mono.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
            })
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
            if samples.is_empty() {
                return Ok(String::new());
            }
            if sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    sample_rate
                )));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(params, samples)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(text)
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Best available decode backend: local Whisper (feature + configured model),
/// then the remote API when a key is available, else the placeholder.
pub fn create_best_stt(config: &SpeechServiceConfig) -> Box<dyn SttBackend> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.whisper_model_path.as_deref().map(str::trim) {
            if !path.is_empty() {
                match WhisperStt::new(path) {
                    Ok(w) => return Box::new(w),
                    Err(e) => tracing::warn!(error = %e, "Whisper unavailable, trying remote STT"),
                }
            }
        }
    }
    match OpenAiStt::from_config(config) {
        Ok(remote) => Box::new(remote),
        Err(e) => {
            tracing::warn!(error = %e, "remote STT unavailable, using placeholder");
            Box::new(PlaceholderStt::new())
        }
    }
}
