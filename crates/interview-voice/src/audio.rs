//! Audio I/O Adapter: microphone acquisition, capture taps and speech playback.
//!
//! This is the only module touching hardware. The orchestrator sees the
//! [`AudioIo`] trait, recognizers read microphone chunks through
//! [`AudioSource`] taps, and the realtime transport plays PCM through
//! [`PcmSink`]. [`DeviceAudio`] implements all three on CPAL + Rodio.

use crate::error::{looks_like_permission_error, VoiceError, VoiceResult};
use crate::voice_output::{TtsBackend, VoiceOutput};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per chunk (default: 480 for 30ms at 16kHz)
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            buffer_size: 480, // 30ms at 16kHz
        }
    }
}

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: std::time::Instant,
}

/// Capture problems reported by the host audio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFault {
    PermissionRevoked,
    DeviceUnavailable(String),
    Transient(String),
}

/// What a capture tap delivers.
#[derive(Debug, Clone)]
pub enum TapFrame {
    Chunk(AudioChunk),
    Fault(CaptureFault),
}

/// Which speech primitives the host offers. Checked before `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeechCapabilities {
    pub recognition: bool,
    pub synthesis: bool,
}

impl SpeechCapabilities {
    pub fn full() -> Self {
        Self {
            recognition: true,
            synthesis: true,
        }
    }

    /// `CapabilityMissing` naming whatever is absent.
    pub fn require_all(&self) -> VoiceResult<()> {
        match (self.recognition, self.synthesis) {
            (true, true) => Ok(()),
            (false, true) => Err(VoiceError::CapabilityMissing("speech recognition".to_string())),
            (true, false) => Err(VoiceError::CapabilityMissing("speech synthesis".to_string())),
            (false, false) => Err(VoiceError::CapabilityMissing(
                "speech recognition and synthesis".to_string(),
            )),
        }
    }
}

/// Hardware boundary used by the turn-taking orchestrator.
#[async_trait]
pub trait AudioIo: Send + Sync {
    fn capabilities(&self) -> SpeechCapabilities;

    /// Ask for the microphone. `PermissionDenied` / `DeviceUnavailable` are terminal.
    async fn acquire_microphone(&self) -> VoiceResult<()>;

    /// Release the microphone. Idempotent.
    fn release_microphone(&self);

    /// Synthesize and play `text`; resolves only once playback has fully ended.
    async fn speak(&self, text: &str) -> VoiceResult<()>;

    /// Stop playback immediately. Idempotent.
    fn stop_playback(&self);
}

/// Microphone chunks for recognizers and the realtime transport.
pub trait AudioSource: Send + Sync {
    /// New tap on the live microphone stream. Fails if the microphone is not acquired.
    fn open_tap(&self) -> VoiceResult<std_mpsc::Receiver<TapFrame>>;

    fn sample_rate(&self) -> u32;
}

/// Ordered PCM playback for streamed speech.
pub trait PcmSink: Send + Sync {
    /// Queue mono PCM16 behind everything already queued.
    fn enqueue_pcm16(&self, samples: Vec<i16>, sample_rate: u32) -> VoiceResult<()>;

    /// Drop everything queued or playing.
    fn clear(&self);

    /// Whether queued audio is still audible.
    fn is_playing(&self) -> bool;
}

/// Async view of a capture tap. Dropping it stops the forwarding thread.
pub struct TapBridge {
    pub rx: mpsc::UnboundedReceiver<TapFrame>,
    stop: Arc<AtomicBool>,
}

impl Drop for TapBridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Forward a blocking tap into a tokio channel on a small helper thread.
pub fn bridge_tap(tap: std_mpsc::Receiver<TapFrame>) -> TapBridge {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let spawned = thread::Builder::new()
        .name("interview-tap-bridge".to_string())
        .spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                match tap.recv_timeout(Duration::from_millis(50)) {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });
    if let Err(e) = spawned {
        // receiver closes immediately; readers see a closed tap
        warn!("tap bridge thread failed to start: {}", e);
    }

    TapBridge { rx, stop }
}

type TapList = Arc<Mutex<Vec<std_mpsc::Sender<TapFrame>>>>;

fn broadcast(taps: &TapList, frame: TapFrame) {
    if let Ok(mut taps) = taps.lock() {
        taps.retain(|tap| tap.send(frame.clone()).is_ok());
    }
}

fn classify_stream_error(err: cpal::StreamError) -> CaptureFault {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            CaptureFault::DeviceUnavailable("input device disconnected".to_string())
        }
        cpal::StreamError::BackendSpecific { err } => {
            if looks_like_permission_error(&err.description) {
                CaptureFault::PermissionRevoked
            } else {
                CaptureFault::Transient(err.description)
            }
        }
    }
}

/// Keeps the capture thread (and its `!Send` CPAL stream) alive.
struct CaptureHandle {
    _stop: std_mpsc::Sender<()>,
}

/// CPAL microphone + Rodio speaker.
pub struct DeviceAudio {
    config: AudioConfig,
    tts: Arc<dyn TtsBackend>,
    taps: TapList,
    capture: Mutex<Option<CaptureHandle>>,
    output: Mutex<Option<Arc<VoiceOutput>>>,
}

impl DeviceAudio {
    pub fn new(config: AudioConfig, tts: Arc<dyn TtsBackend>) -> Self {
        info!(
            "🎤 Audio adapter ({}Hz, {} channel(s), {} samples/chunk)",
            config.sample_rate, config.channels, config.buffer_size
        );
        Self {
            config,
            tts,
            taps: Arc::new(Mutex::new(Vec::new())),
            capture: Mutex::new(None),
            output: Mutex::new(None),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    fn output(&self) -> VoiceResult<Arc<VoiceOutput>> {
        let mut slot = self
            .output
            .lock()
            .map_err(|e| VoiceError::Playback(format!("output lock poisoned: {}", e)))?;
        if let Some(ref out) = *slot {
            return Ok(Arc::clone(out));
        }
        let out = Arc::new(VoiceOutput::new()?);
        *slot = Some(Arc::clone(&out));
        Ok(out)
    }

    /// Build the input stream on a dedicated thread (CPAL streams are `!Send`
    /// on some platforms) and block until it is playing or has failed.
    fn spawn_capture(config: AudioConfig, taps: TapList) -> VoiceResult<CaptureHandle> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("interview-capture".to_string())
            .spawn(move || {
                let stream = match Self::build_input_stream(&config, taps) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // parked until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("capture thread exiting");
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioStream("capture thread exited during setup".to_string()))??;
        Ok(CaptureHandle { _stop: stop_tx })
    }

    fn build_input_stream(config: &AudioConfig, taps: TapList) -> VoiceResult<cpal::Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        let default_config = device.default_input_config()?;
        debug!("Default input config: {:?}", default_config);

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
        };

        let chunk_size = config.buffer_size;
        let channels = config.channels.max(1) as usize;
        let mut pending = Vec::with_capacity(chunk_size);
        let data_taps = Arc::clone(&taps);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // downmix to mono by taking the first channel
                for frame in data.chunks(channels) {
                    pending.push(frame[0]);
                    if pending.len() >= chunk_size {
                        let chunk = AudioChunk {
                            samples: std::mem::replace(&mut pending, Vec::with_capacity(chunk_size)),
                            timestamp: std::time::Instant::now(),
                        };
                        broadcast(&data_taps, TapFrame::Chunk(chunk));
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
                broadcast(&taps, TapFrame::Fault(classify_stream_error(err)));
            },
            None,
        )?;
        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }
}

#[async_trait]
impl AudioIo for DeviceAudio {
    fn capabilities(&self) -> SpeechCapabilities {
        let host = cpal::default_host();
        SpeechCapabilities {
            recognition: host.default_input_device().is_some(),
            synthesis: host.default_output_device().is_some(),
        }
    }

    async fn acquire_microphone(&self) -> VoiceResult<()> {
        if self.is_capturing() {
            return Ok(());
        }
        let config = self.config.clone();
        let taps = Arc::clone(&self.taps);
        let handle = tokio::task::spawn_blocking(move || Self::spawn_capture(config, taps))
            .await
            .map_err(|e| VoiceError::AudioStream(format!("capture setup task failed: {}", e)))??;

        let mut slot = self
            .capture
            .lock()
            .map_err(|e| VoiceError::AudioStream(format!("capture lock poisoned: {}", e)))?;
        *slot = Some(handle);
        Ok(())
    }

    fn release_microphone(&self) {
        let released = self.capture.lock().ok().and_then(|mut slot| slot.take());
        if released.is_some() {
            info!("🛑 Microphone released");
        }
        // closing every tap wakes any reader still attached
        if let Ok(mut taps) = self.taps.lock() {
            taps.clear();
        }
    }

    async fn speak(&self, text: &str) -> VoiceResult<()> {
        let tts = Arc::clone(&self.tts);
        let owned = text.to_string();
        let bytes = tokio::task::spawn_blocking(move || tts.synthesize(&owned))
            .await
            .map_err(|e| VoiceError::Tts(format!("synthesis task failed: {}", e)))??;
        if bytes.is_empty() {
            return Ok(());
        }

        let output = self.output()?;
        output.play_bytes(&bytes)?;
        tokio::task::spawn_blocking(move || output.sleep_until_end())
            .await
            .map_err(|e| VoiceError::Playback(format!("playback wait failed: {}", e)))?;
        Ok(())
    }

    fn stop_playback(&self) {
        if let Ok(slot) = self.output.lock() {
            if let Some(ref out) = *slot {
                out.stop();
            }
        }
    }
}

impl AudioSource for DeviceAudio {
    fn open_tap(&self) -> VoiceResult<std_mpsc::Receiver<TapFrame>> {
        if !self.is_capturing() {
            return Err(VoiceError::DeviceUnavailable(
                "microphone has not been acquired".to_string(),
            ));
        }
        let (tx, rx) = std_mpsc::channel();
        self.taps
            .lock()
            .map_err(|e| VoiceError::AudioStream(format!("tap lock poisoned: {}", e)))?
            .push(tx);
        Ok(rx)
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

impl PcmSink for DeviceAudio {
    fn enqueue_pcm16(&self, samples: Vec<i16>, sample_rate: u32) -> VoiceResult<()> {
        self.output()?.play_pcm16(samples, sample_rate);
        Ok(())
    }

    fn clear(&self) {
        self.stop_playback();
    }

    fn is_playing(&self) -> bool {
        self.output
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|out| out.is_playing()))
            .unwrap_or(false)
    }
}
