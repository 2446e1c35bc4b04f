//! Speech recognizers built on the microphone tap.
//!
//! * [`LiveRecognizer`]: VAD + gap segmentation, optional interim decodes,
//!   one final fragment per committed utterance.
//! * [`BufferedRecognizer`]: records a fixed clip, then decodes it once.
//!
//! Both run exactly one capture window per `listen` call.

use crate::audio::{bridge_tap, AudioSource, CaptureFault, TapFrame};
use crate::config::CaptureConfig;
use crate::error::VoiceError;
use crate::segmenter::{SegmentEvent, SegmenterConfig, UtteranceSegmenter};
use crate::stt::{FragmentSink, RecognitionError, RecognitionMode, SpeechRecognizer, SttBackend};
use crate::vad::{VadConfig, VadDetector};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl From<CaptureFault> for RecognitionError {
    fn from(fault: CaptureFault) -> Self {
        match fault {
            CaptureFault::PermissionRevoked => RecognitionError::PermissionRevoked,
            CaptureFault::DeviceUnavailable(msg) => RecognitionError::DeviceUnavailable(msg),
            CaptureFault::Transient(msg) => RecognitionError::TransientFailure(msg),
        }
    }
}

fn tap_error(err: VoiceError) -> RecognitionError {
    match err {
        VoiceError::PermissionDenied(_) => RecognitionError::PermissionRevoked,
        VoiceError::DeviceUnavailable(msg) => RecognitionError::DeviceUnavailable(msg),
        other => RecognitionError::TransientFailure(other.to_string()),
    }
}

/// Decode a finished clip and report it as the final fragment.
fn deliver_final(
    stt: &dyn SttBackend,
    audio: &[f32],
    sample_rate: u32,
    sink: &FragmentSink,
) -> Result<(), RecognitionError> {
    let text = stt
        .transcribe(audio, sample_rate)
        .map_err(|e| RecognitionError::TransientFailure(e.to_string()))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(RecognitionError::NoSpeechDetected);
    }
    info!("📝 Final transcript: \"{}\"", text);
    sink.final_text(text);
    Ok(())
}

/// Sets the worker's stop flag when the `listen` future is dropped.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Continuous recognizer: WebRTC VAD decides speech, the segmenter decides
/// when the candidate is done.
pub struct LiveRecognizer {
    source: Arc<dyn AudioSource>,
    stt: Arc<dyn SttBackend>,
    capture: CaptureConfig,
}

impl LiveRecognizer {
    pub fn new(source: Arc<dyn AudioSource>, stt: Arc<dyn SttBackend>, capture: CaptureConfig) -> Self {
        Self { source, stt, capture }
    }
}

#[async_trait]
impl SpeechRecognizer for LiveRecognizer {
    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Live
    }

    async fn listen(&self, sink: FragmentSink) -> Result<(), RecognitionError> {
        let tap = self.source.open_tap().map_err(tap_error)?;
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));

        let job = LiveCapture {
            tap,
            stt: Arc::clone(&self.stt),
            capture: self.capture.clone(),
            sample_rate: self.source.sample_rate(),
            sink,
            stop,
        };
        // the VAD is !Send, so the whole window runs on one blocking thread
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| RecognitionError::TransientFailure(format!("capture worker failed: {}", e)))?
    }
}

struct LiveCapture {
    tap: std_mpsc::Receiver<TapFrame>,
    stt: Arc<dyn SttBackend>,
    capture: CaptureConfig,
    sample_rate: u32,
    sink: FragmentSink,
    stop: Arc<AtomicBool>,
}

impl LiveCapture {
    fn run(self) -> Result<(), RecognitionError> {
        let mut vad = VadDetector::new(VadConfig {
            sample_rate: self.sample_rate,
            mode: self.capture.vad_mode,
        })
        .map_err(|e| RecognitionError::TransientFailure(e.to_string()))?;
        let mut segmenter = UtteranceSegmenter::new(SegmenterConfig {
            sample_rate: self.sample_rate,
            ..SegmenterConfig::from(&self.capture)
        });

        let frame = vad.frame_size();
        let deadline = Instant::now() + self.capture.capture_window();
        let partial_interval = self.capture.partial_interval();
        let mut last_partial = Instant::now();
        let mut pending: Vec<f32> = Vec::with_capacity(frame * 2);

        debug!("👂 Listening (window {:?})", self.capture.capture_window());
        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!("capture window cancelled");
                return Ok(());
            }
            // an utterance in progress may run past the window
            if !segmenter.is_active() && Instant::now() >= deadline {
                return Err(RecognitionError::NoSpeechDetected);
            }

            match self.tap.recv_timeout(Duration::from_millis(50)) {
                Ok(TapFrame::Chunk(chunk)) => {
                    pending.extend_from_slice(&chunk.samples);
                    while pending.len() >= frame {
                        let piece: Vec<f32> = pending.drain(..frame).collect();
                        let speech = vad
                            .is_speech(&piece)
                            .map_err(|e| RecognitionError::TransientFailure(e.to_string()))?;
                        match segmenter.push(speech, &piece) {
                            Some(SegmentEvent::Utterance(audio)) => {
                                return deliver_final(self.stt.as_ref(), &audio, self.sample_rate, &self.sink);
                            }
                            Some(SegmentEvent::SpeechStarted) => {
                                debug!("🗣️ Candidate started speaking");
                                last_partial = Instant::now();
                            }
                            Some(SegmentEvent::Discarded) | None => {}
                        }
                    }

                    if let Some(interval) = partial_interval {
                        if segmenter.is_active() && last_partial.elapsed() >= interval {
                            last_partial = Instant::now();
                            self.emit_partial(segmenter.buffered());
                        }
                    }
                }
                Ok(TapFrame::Fault(fault)) => {
                    warn!("capture fault: {:?}", fault);
                    return Err(fault.into());
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(RecognitionError::DeviceUnavailable(
                        "microphone stream closed".to_string(),
                    ));
                }
            }
        }
    }

    fn emit_partial(&self, audio: &[f32]) {
        match self.stt.transcribe(audio, self.sample_rate) {
            Ok(text) if !text.trim().is_empty() => self.sink.interim(text.trim()),
            Ok(_) => {}
            Err(e) => debug!("interim decode failed: {}", e),
        }
    }
}

/// Clip recognizer: record `clip_ms`, decode once, report a single final
/// fragment or `NoSpeechDetected`.
pub struct BufferedRecognizer {
    source: Arc<dyn AudioSource>,
    stt: Arc<dyn SttBackend>,
    clip: Duration,
}

impl BufferedRecognizer {
    pub fn new(source: Arc<dyn AudioSource>, stt: Arc<dyn SttBackend>, capture: &CaptureConfig) -> Self {
        Self {
            source,
            stt,
            clip: capture.clip_duration(),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for BufferedRecognizer {
    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Buffered
    }

    async fn listen(&self, sink: FragmentSink) -> Result<(), RecognitionError> {
        let sample_rate = self.source.sample_rate();
        let target = (self.clip.as_millis() as u64 * sample_rate as u64 / 1000) as usize;
        let mut bridge = bridge_tap(self.source.open_tap().map_err(tap_error)?);
        let mut clip: Vec<f32> = Vec::with_capacity(target);

        info!("🎙️ Recording {:?} clip", self.clip);
        // a stalled device should not hold the session forever
        let deadline = tokio::time::Instant::now() + self.clip * 2;
        while clip.len() < target {
            match tokio::time::timeout_at(deadline, bridge.rx.recv()).await {
                Ok(Some(TapFrame::Chunk(chunk))) => clip.extend_from_slice(&chunk.samples),
                Ok(Some(TapFrame::Fault(fault))) => return Err(fault.into()),
                Ok(None) => {
                    return Err(RecognitionError::DeviceUnavailable(
                        "microphone stream closed".to_string(),
                    ))
                }
                Err(_) => {
                    warn!("clip recording stalled after {} samples", clip.len());
                    break;
                }
            }
        }
        drop(bridge);

        if clip.is_empty() {
            return Err(RecognitionError::NoSpeechDetected);
        }
        clip.truncate(target);

        let stt = Arc::clone(&self.stt);
        tokio::task::spawn_blocking(move || deliver_final(stt.as_ref(), &clip, sample_rate, &sink))
            .await
            .map_err(|e| RecognitionError::TransientFailure(format!("decode worker failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::error::VoiceResult;
    use crate::stt::PlaceholderStt;
    use std::sync::Mutex;

    /// Source that hands out one prepared tap.
    struct ScriptedSource {
        frames: Mutex<Option<Vec<TapFrame>>>,
        keep_open: Mutex<Vec<std_mpsc::Sender<TapFrame>>>,
        hold: bool,
    }

    impl ScriptedSource {
        fn new(frames: Vec<TapFrame>, hold: bool) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Some(frames)),
                keep_open: Mutex::new(Vec::new()),
                hold,
            })
        }
    }

    impl AudioSource for ScriptedSource {
        fn open_tap(&self) -> VoiceResult<std_mpsc::Receiver<TapFrame>> {
            let frames = self
                .frames
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| VoiceError::DeviceUnavailable("tap already used".into()))?;
            let (tx, rx) = std_mpsc::channel();
            for frame in frames {
                tx.send(frame).unwrap();
            }
            if self.hold {
                self.keep_open.lock().unwrap().push(tx);
            }
            Ok(rx)
        }

        fn sample_rate(&self) -> u32 {
            16000
        }
    }

    fn chunk(len: usize) -> TapFrame {
        TapFrame::Chunk(AudioChunk {
            samples: vec![0.0; len],
            timestamp: Instant::now(),
        })
    }

    fn short_window() -> CaptureConfig {
        CaptureConfig {
            capture_window_ms: 100,
            clip_ms: 100,
            ..CaptureConfig::default()
        }
    }

    #[tokio::test]
    async fn live_silence_reports_no_speech() {
        let source = ScriptedSource::new(vec![chunk(480), chunk(480)], true);
        let recognizer = LiveRecognizer::new(source, Arc::new(PlaceholderStt::new()), short_window());
        let (sink, mut rx) = FragmentSink::channel();
        let result = recognizer.listen(sink).await;
        assert_eq!(result, Err(RecognitionError::NoSpeechDetected));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_permission_fault_is_terminal() {
        let source = ScriptedSource::new(vec![TapFrame::Fault(CaptureFault::PermissionRevoked)], true);
        let recognizer = LiveRecognizer::new(source, Arc::new(PlaceholderStt::new()), short_window());
        let (sink, _rx) = FragmentSink::channel();
        let result = recognizer.listen(sink).await;
        assert_eq!(result, Err(RecognitionError::PermissionRevoked));
    }

    #[tokio::test]
    async fn live_closed_tap_means_device_gone() {
        let source = ScriptedSource::new(vec![], false);
        let recognizer = LiveRecognizer::new(source, Arc::new(PlaceholderStt::new()), CaptureConfig::default());
        let (sink, _rx) = FragmentSink::channel();
        let result = recognizer.listen(sink).await;
        assert!(matches!(result, Err(RecognitionError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn buffered_clip_is_decoded_once() {
        let source = ScriptedSource::new(vec![chunk(800), chunk(800)], true);
        let recognizer = BufferedRecognizer::new(
            source,
            Arc::new(PlaceholderStt::with_response("  I led the payments team  ")),
            &short_window(),
        );
        let (sink, mut rx) = FragmentSink::channel();
        recognizer.listen(sink).await.unwrap();

        let fragment = rx.recv().await.unwrap();
        assert!(fragment.is_final);
        assert_eq!(fragment.text, "I led the payments team");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn buffered_blank_decode_is_no_speech() {
        let source = ScriptedSource::new(vec![chunk(1600)], true);
        let recognizer = BufferedRecognizer::new(source, Arc::new(PlaceholderStt::with_response("")), &short_window());
        let (sink, _rx) = FragmentSink::channel();
        assert_eq!(recognizer.listen(sink).await, Err(RecognitionError::NoSpeechDetected));
    }

    #[test]
    fn capture_faults_map_to_recognition_errors() {
        assert_eq!(
            RecognitionError::from(CaptureFault::Transient("xrun".into())),
            RecognitionError::TransientFailure("xrun".into())
        );
        assert!(RecognitionError::from(CaptureFault::DeviceUnavailable("unplugged".into())).is_terminal());
    }
}
