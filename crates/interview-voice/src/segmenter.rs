//! Utterance segmentation for live recognition.
//!
//! Feeds VAD decisions chunk by chunk and decides when the candidate has
//! finished an utterance. Time is measured in samples, not wall clock, so the
//! result depends only on the audio that was fed in.

use crate::config::CaptureConfig;
use std::time::Duration;
use tracing::{debug, info};

/// Segmentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Waiting for speech
    Idle,

    /// Candidate is speaking
    Speaking,

    /// Speech paused; waiting to see whether the gap closes the utterance
    TrailingSilence,
}

/// What a pushed chunk produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// First speech chunk of a new utterance.
    SpeechStarted,

    /// Utterance finished: speech plus the trailing gap.
    Utterance(Vec<f32>),

    /// A burst shorter than the minimum speech length; buffered audio was dropped.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    /// Silence that closes an utterance.
    pub gap: Duration,
    /// Utterances with less speech than this are noise.
    pub min_speech: Duration,
    /// Hard cap; a monologue is cut here.
    pub max_utterance: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            gap: Duration::from_millis(800),
            min_speech: Duration::from_millis(200),
            max_utterance: Duration::from_secs(30),
        }
    }
}

impl From<&CaptureConfig> for SegmenterConfig {
    fn from(capture: &CaptureConfig) -> Self {
        Self {
            sample_rate: capture.sample_rate,
            gap: Duration::from_millis(capture.gap_ms),
            min_speech: Duration::from_millis(capture.min_speech_ms),
            max_utterance: Duration::from_millis(capture.max_utterance_ms),
        }
    }
}

fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_millis() as u64 * sample_rate as u64 / 1000) as usize
}

/// Gap-based utterance segmenter.
pub struct UtteranceSegmenter {
    state: SegmentState,
    buffer: Vec<f32>,
    speech_samples: usize,
    silence_samples: usize,
    gap_samples: usize,
    min_speech_samples: usize,
    max_samples: usize,
}

impl UtteranceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            state: SegmentState::Idle,
            buffer: Vec::new(),
            speech_samples: 0,
            silence_samples: 0,
            gap_samples: samples_for(config.gap, config.sample_rate).max(1),
            min_speech_samples: samples_for(config.min_speech, config.sample_rate),
            max_samples: samples_for(config.max_utterance, config.sample_rate).max(1),
        }
    }

    /// Feed one chunk together with its VAD decision.
    pub fn push(&mut self, is_speech: bool, chunk: &[f32]) -> Option<SegmentEvent> {
        match (self.state, is_speech) {
            (SegmentState::Idle, false) => None,
            (SegmentState::Idle, true) => {
                self.state = SegmentState::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(chunk);
                self.speech_samples = chunk.len();
                self.silence_samples = 0;
                debug!("segmenter: speech started");
                if self.buffer.len() >= self.max_samples {
                    return Some(self.commit());
                }
                Some(SegmentEvent::SpeechStarted)
            }
            (SegmentState::Speaking, true) | (SegmentState::TrailingSilence, true) => {
                self.state = SegmentState::Speaking;
                self.buffer.extend_from_slice(chunk);
                self.speech_samples += chunk.len();
                self.silence_samples = 0;
                if self.buffer.len() >= self.max_samples {
                    info!("segmenter: utterance hit the length cap");
                    return Some(self.commit());
                }
                None
            }
            (SegmentState::Speaking, false) | (SegmentState::TrailingSilence, false) => {
                self.state = SegmentState::TrailingSilence;
                self.buffer.extend_from_slice(chunk);
                self.silence_samples += chunk.len();
                if self.silence_samples >= self.gap_samples || self.buffer.len() >= self.max_samples {
                    return Some(self.commit());
                }
                None
            }
        }
    }

    fn commit(&mut self) -> SegmentEvent {
        let speech = self.speech_samples;
        let audio = std::mem::take(&mut self.buffer);
        self.reset();
        if speech < self.min_speech_samples {
            debug!("segmenter: discarded {} samples of speech", speech);
            SegmentEvent::Discarded
        } else {
            info!("segmenter: utterance complete ({} samples)", audio.len());
            SegmentEvent::Utterance(audio)
        }
    }

    /// Audio of the utterance in progress, for interim decodes.
    pub fn buffered(&self) -> &[f32] {
        &self.buffer
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// True while an utterance is being collected.
    pub fn is_active(&self) -> bool {
        self.state != SegmentState::Idle
    }

    /// Whatever is buffered, if it is long enough to count as an utterance.
    /// Used when the capture window closes mid-utterance.
    pub fn flush(&mut self) -> Option<Vec<f32>> {
        if !self.is_active() {
            return None;
        }
        match self.commit() {
            SegmentEvent::Utterance(audio) => Some(audio),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.buffer.clear();
        self.speech_samples = 0;
        self.silence_samples = 0;
    }
}
