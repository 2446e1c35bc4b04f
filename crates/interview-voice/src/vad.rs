//! Voice Activity Detection using WebRTC VAD
//!
//! Used by the live recognizer to tell speech chunks from silence. The
//! underlying `Vad` is `!Send`, so a detector must stay on the thread that
//! created it.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

impl VadConfig {
    fn vad_mode(&self) -> VoiceResult<VadMode> {
        match self.mode {
            0 => Ok(VadMode::Quality),
            1 => Ok(VadMode::LowBitrate),
            2 => Ok(VadMode::Aggressive),
            3 => Ok(VadMode::VeryAggressive),
            other => Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", other))),
        }
    }

    fn vad_rate(&self) -> VoiceResult<SampleRate> {
        match self.sample_rate {
            8000 => Ok(SampleRate::Rate8kHz),
            16000 => Ok(SampleRate::Rate16kHz),
            32000 => Ok(SampleRate::Rate32kHz),
            48000 => Ok(SampleRate::Rate48kHz),
            other => Err(VoiceError::VadInit(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                other
            ))),
        }
    }

    /// 30ms frame, the largest WebRTC VAD accepts.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as usize * 30) / 1000
    }
}

/// Voice Activity Detector using WebRTC VAD
pub struct VadDetector {
    vad: Vad,
    config: VadConfig,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        let mode = config.vad_mode()?;
        let rate = config.vad_rate()?;

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);

        info!(
            "🎙️ WebRTC VAD ready (sample_rate: {}Hz, mode: {}, frame: {} samples)",
            config.sample_rate,
            config.mode,
            config.frame_size()
        );
        Ok(Self { vad, config })
    }

    /// Classify one chunk. Chunks of any length are split into 30ms frames;
    /// the chunk counts as speech if any full frame does. A trailing partial
    /// frame is ignored.
    pub fn is_speech(&mut self, audio: &[f32]) -> VoiceResult<bool> {
        let frame = self.config.frame_size();
        if audio.len() < frame {
            return Err(VoiceError::VadProcessing(format!(
                "Expected at least {} samples, got {}",
                frame,
                audio.len()
            )));
        }

        let mut speech = false;
        for window in audio.chunks_exact(frame) {
            let pcm: Vec<i16> = window.iter().map(|&s| crate::stt::f32_to_i16(s)).collect();
            let voiced = self
                .vad
                .is_voice_segment(&pcm)
                .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;
            speech |= voiced;
        }
        debug!("VAD result: {}", if speech { "SPEECH" } else { "SILENCE" });
        Ok(speech)
    }

    pub fn frame_size(&self) -> usize {
        self.config.frame_size()
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}
