//! **VoiceOutput**: interviewer speech synthesis and playback.
//!
//! `TtsBackend` turns text into encoded audio; `VoiceOutput` owns a `rodio::Sink`
//! for playing it. The Rodio output stream is `!Send`, so it lives on its own
//! thread for as long as the `VoiceOutput` exists.

use crate::config::SpeechServiceConfig;
use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Backend that turns text into audio bytes (WAV/MP3).
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. Return empty vec to skip playback.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// OpenAI-compatible speech API (`{api_url}/audio/speech`).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub voice: String,
    client: reqwest::blocking::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }

    pub fn from_config(config: &SpeechServiceConfig) -> VoiceResult<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            VoiceError::Config("TTS requires speech.api_key, TTS_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        Self::new(
            config.api_url.clone(),
            api_key,
            config.tts_model.clone(),
            config.voice.clone(),
        )
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        })
    }
}

impl TtsBackend for OpenAiTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text))
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Manages playback of synthesized or streamed speech.
pub struct VoiceOutput {
    sink: Arc<Sink>,
    // dropping this lets the stream thread exit
    _keepalive: std_mpsc::Sender<()>,
}

impl VoiceOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("interview-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sink));
                let _ = keepalive_rx.recv();
                drop(stream);
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited during setup".to_string()))??;
        info!("VoiceOutput: sink ready for playback");
        Ok(Self {
            sink,
            _keepalive: keepalive_tx,
        })
    }

    /// Play encoded audio bytes (WAV/MP3).
    pub fn play_bytes(&self, bytes: &[u8]) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let cursor = Cursor::new(bytes.to_vec());
        let source = rodio::Decoder::new(cursor)
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    /// Queue raw mono PCM16. Appends are played back to back, in order.
    pub fn play_pcm16(&self, samples: Vec<i16>, sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        self.sink
            .append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
    }

    /// Stop playback immediately and clear the queue.
    pub fn stop(&self) {
        self.sink.stop();
        info!("VoiceOutput: stopped");
    }

    /// Whether the sink currently has queued samples (playing or pending).
    pub fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    /// Block until all currently queued audio has finished.
    pub fn sleep_until_end(&self) {
        self.sink.sleep_until_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_tts_returns_empty() {
        let tts = PlaceholderTts;
        assert!(tts.synthesize("hello").unwrap().is_empty());
    }

    #[test]
    fn tts_request_carries_voice_and_model() {
        let tts = OpenAiTts::new("https://example.test/v1", "key", "tts-1", "alloy").unwrap();
        let body = tts.request_body("Tell me about yourself");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["input"], "Tell me about yourself");
    }

    #[test]
    fn blank_text_skips_the_network() {
        let tts = OpenAiTts::new("http://127.0.0.1:9", "key", "tts-1", "alloy").unwrap();
        assert!(tts.synthesize("   ").unwrap().is_empty());
    }
}
