//! Transport Session: the realtime mode, where a remote service does
//! recognition, dialogue and synthesis over one persistent WebSocket.
//!
//! ```text
//!   mic tap ──base64 PCM16──▶ input_audio_buffer.append ──▶ ┐
//!                                                           │ realtime
//!   PcmSink ◀── response.audio.delta (in arrival order) ◀── │ service
//!   TranscriptLog ◀── transcription.completed / transcript.done ┘
//! ```
//!
//! Connection attempts go through a [`Backoff`]; a lost connection discards
//! the pending interviewer transcript and the playback queue, then reconnects.

use crate::audio::{bridge_tap, AudioIo, AudioSource, CaptureFault, PcmSink, TapBridge, TapFrame};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{InterviewConfig, TransportConfig};
use crate::dialogue::interviewer_instructions;
use crate::error::{VoiceError, VoiceResult};
use crate::session::{CompletionReport, EndReason, InterviewContext, OnComplete};
use crate::stt::f32_to_i16;
use crate::transcript::{Speaker, TranscriptLog, TranscriptReader};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// An open connection as a pair of JSON text-frame channels. Dropping the
/// link tears down whatever pumps it.
pub struct RealtimeLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeLink {
    pub fn new(outbound: mpsc::UnboundedSender<String>, inbound: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }
}

impl Drop for RealtimeLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens realtime connections.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> VoiceResult<RealtimeLink>;
}

/// OpenAI realtime endpoint over tokio-tungstenite.
pub struct WebSocketConnector {
    url: String,
    api_key: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> VoiceResult<Self> {
        let key = config.resolved_api_key().ok_or_else(|| {
            VoiceError::Config("realtime mode requires transport.api_key or OPENAI_API_KEY".to_string())
        })?;
        Ok(Self::new(config.url.clone(), key))
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self) -> VoiceResult<RealtimeLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Transport(format!("bad realtime url: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| VoiceError::Config(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoiceError::Transport(format!("connect failed: {}", e)))?;
        info!("🔌 Realtime WebSocket connected");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    warn!("realtime send failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        info!("🔌 Realtime server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("realtime receive failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut link = RealtimeLink::new(out_tx, in_rx);
        link.tasks.push(writer);
        link.tasks.push(reader);
        Ok(link)
    }
}

/// Server events the session reacts to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    CandidateTranscript {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn parse(text: &str) -> VoiceResult<Self> {
        serde_json::from_str(text).map_err(|e| VoiceError::Protocol(format!("bad realtime event: {}", e)))
    }
}

/// `session.update` configuring the interviewer persona, audio formats and
/// server-side turn detection.
pub fn session_update(config: &TransportConfig, instructions: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": instructions,
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": {
                "type": "server_vad",
                "threshold": config.vad_threshold,
                "prefix_padding_ms": config.prefix_padding_ms,
                "silence_duration_ms": config.silence_duration_ms,
            },
            "temperature": config.temperature,
            "max_response_output_tokens": 4096,
        }
    })
}

/// `input_audio_buffer.append` for one microphone chunk.
pub fn audio_append(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    serde_json::json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(bytes),
    })
    .to_string()
}

/// Decode a base64 little-endian PCM16 delta.
pub fn decode_pcm16(delta: &str) -> VoiceResult<Vec<i16>> {
    let bytes = BASE64
        .decode(delta)
        .map_err(|e| VoiceError::Protocol(format!("audio delta is not base64: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Protocol(format!(
            "audio delta has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Interviewer audio, handed to the sink strictly in arrival order.
pub struct PlaybackQueue {
    sink: Arc<dyn PcmSink>,
    sample_rate: u32,
    queued_chunks: u64,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn PcmSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            queued_chunks: 0,
        }
    }

    pub fn push_base64(&mut self, delta: &str) -> VoiceResult<()> {
        let samples = decode_pcm16(delta)?;
        if samples.is_empty() {
            return Ok(());
        }
        self.sink.enqueue_pcm16(samples, self.sample_rate)?;
        self.queued_chunks += 1;
        Ok(())
    }

    /// Chunks queued since the last clear.
    pub fn queued_chunks(&self) -> u64 {
        self.queued_chunks
    }

    pub fn is_playing(&self) -> bool {
        self.sink.is_playing()
    }

    pub fn clear(&mut self) {
        if self.queued_chunks > 0 {
            debug!(chunks = self.queued_chunks, "discarding queued interviewer audio");
        }
        self.sink.clear();
        self.queued_chunks = 0;
    }
}

/// Observable state of a realtime interview.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStatus {
    pub session_id: Option<Uuid>,
    pub state: TransportState,
    pub interviewer_speaking: bool,
    /// Server VAD reports the candidate talking.
    pub candidate_speaking: bool,
    pub connection_unstable: bool,
    /// Interviewer transcript accumulated so far for the current response.
    pub interim: Option<String>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub end_reason: Option<EndReason>,
}

/// What `RealtimeSession::start` hands back.
#[derive(Debug, Clone)]
pub struct RealtimeHandle {
    pub session_id: Uuid,
    pub transcript: TranscriptReader,
    pub status: watch::Receiver<TransportStatus>,
}

struct RunState {
    session_id: Uuid,
    context: InterviewContext,
    transcript: TranscriptLog,
    pending: String,
    playback: PlaybackQueue,
    backoff: Backoff,
    configured: bool,
    completed_turns: u32,
    // microphone request first, then the connect/pump loop
    task: Option<AbortHandle>,
}

impl RunState {
    fn report(&self, reason: EndReason) -> CompletionReport {
        CompletionReport {
            session_id: self.session_id,
            reason,
            context: self.context.clone(),
            transcript: self.transcript.snapshot(),
            completed_turns: self.completed_turns,
        }
    }
}

#[derive(Default)]
struct TransportShared {
    run: Option<RunState>,
    epoch: u64,
    status: TransportStatus,
    on_complete: Option<OnComplete>,
}

type Completion = Option<(OnComplete, CompletionReport)>;

enum PumpExit {
    Stale,
    Lost,
    Terminal(EndReason),
}

struct TransportCore {
    config: TransportConfig,
    policy: BackoffPolicy,
    unstable_after: u32,
    connector: Arc<dyn RealtimeConnector>,
    audio: Arc<dyn AudioIo>,
    source: Arc<dyn AudioSource>,
    sink: Arc<dyn PcmSink>,
    shared: Mutex<TransportShared>,
    status_tx: watch::Sender<TransportStatus>,
}

/// Realtime interview over a [`RealtimeConnector`].
pub struct RealtimeSession {
    core: Arc<TransportCore>,
}

impl RealtimeSession {
    pub fn new(
        config: &InterviewConfig,
        connector: Arc<dyn RealtimeConnector>,
        audio: Arc<dyn AudioIo>,
        source: Arc<dyn AudioSource>,
        sink: Arc<dyn PcmSink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TransportStatus::default());
        Self {
            core: Arc::new(TransportCore {
                config: config.transport.clone(),
                policy: BackoffPolicy::from(&config.backoff),
                unstable_after: config.unstable_after,
                connector,
                audio,
                source,
                sink,
                shared: Mutex::new(TransportShared::default()),
                status_tx,
            }),
        }
    }

    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: Fn(CompletionReport) + Send + Sync + 'static,
    {
        self.core.lock().on_complete = Some(Arc::new(callback));
        self
    }

    /// Acquire the microphone and start the connect/pump loop. The
    /// permission request is tracked, so `end()` cancels a pending start.
    pub async fn start(&self, context: InterviewContext) -> VoiceResult<RealtimeHandle> {
        let core = &self.core;
        if let Err(e) = core.audio.capabilities().require_all() {
            error!(error = %e, "❌ Cannot start realtime interview");
            return Err(e);
        }
        if core.source.sample_rate() != core.config.sample_rate {
            return Err(VoiceError::Config(format!(
                "microphone runs at {}Hz but the realtime service expects {}Hz",
                core.source.sample_rate(),
                core.config.sample_rate
            )));
        }

        let (session_id, transcript, epoch, acquire) = {
            let mut shared = core.lock();
            if shared.run.is_some() {
                return Err(VoiceError::SessionActive);
            }
            let audio = Arc::clone(&core.audio);
            let acquire = tokio::spawn(async move { audio.acquire_microphone().await });
            let run = RunState {
                session_id: Uuid::new_v4(),
                context,
                transcript: TranscriptLog::new(),
                pending: String::new(),
                playback: PlaybackQueue::new(Arc::clone(&core.sink), core.config.sample_rate),
                backoff: Backoff::new(core.policy),
                configured: false,
                completed_turns: 0,
                task: Some(acquire.abort_handle()),
            };
            let ids = (run.session_id, run.transcript.reader());
            shared.epoch += 1;
            shared.run = Some(run);
            shared.status = TransportStatus {
                session_id: Some(ids.0),
                ..TransportStatus::default()
            };
            core.publish(&shared);
            (ids.0, ids.1, shared.epoch, acquire)
        };

        info!(session = %session_id, "🎬 Realtime interview starting");
        let acquired = acquire.await;

        let mut shared = core.lock();
        let current = shared.epoch == epoch && shared.run.is_some();
        match acquired {
            Ok(Ok(())) if current => {}
            Ok(Ok(())) => {
                // end() won the race; hand the device straight back
                core.audio.release_microphone();
                return Err(VoiceError::SessionEnded);
            }
            _ if !current => return Err(VoiceError::SessionEnded),
            Ok(Err(e)) => {
                error!(error = %e, "❌ Microphone unavailable");
                shared.status.last_error = Some(e.to_string());
                let completion = core.finish(&mut shared, EndReason::from_startup_error(&e));
                drop(shared);
                TransportCore::notify(completion);
                return Err(e);
            }
            Err(join_err) => {
                let e = VoiceError::AudioDevice(format!("microphone request failed: {}", join_err));
                shared.status.last_error = Some(e.to_string());
                let completion = core.finish(&mut shared, EndReason::DeviceUnavailable);
                drop(shared);
                TransportCore::notify(completion);
                return Err(e);
            }
        }

        let task = tokio::spawn(TransportCore::run(Arc::clone(core), epoch));
        if let Some(run) = shared.run.as_mut() {
            run.task = Some(task.abort_handle());
        }
        drop(shared);

        Ok(RealtimeHandle {
            session_id,
            transcript,
            status: core.status_tx.subscribe(),
        })
    }

    /// Close the connection and release the hardware. Idempotent.
    pub fn end(&self) {
        let completion = {
            let mut shared = self.core.lock();
            self.core.finish(&mut shared, EndReason::Requested)
        };
        TransportCore::notify(completion);
    }

    pub fn status(&self) -> TransportStatus {
        self.core.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.core.status_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.core.lock().run.is_some()
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl TransportCore {
    fn lock(&self) -> MutexGuard<'_, TransportShared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, shared: &TransportShared) {
        self.status_tx.send_replace(shared.status.clone());
    }

    fn notify(completion: Completion) {
        if let Some((callback, report)) = completion {
            callback(report);
        }
    }

    /// Lock and hand out the run state only if `epoch` is still current.
    fn current(&self, epoch: u64) -> Option<MutexGuard<'_, TransportShared>> {
        let shared = self.lock();
        (shared.epoch == epoch && shared.run.is_some()).then_some(shared)
    }

    async fn run(core: Arc<TransportCore>, epoch: u64) {
        loop {
            {
                let Some(mut shared) = core.current(epoch) else { return };
                shared.status.state = TransportState::Connecting;
                core.publish(&shared);
            }

            let mut link = match core.connector.connect().await {
                Ok(link) => link,
                Err(e) => {
                    let Some(delay) = core.connection_failed(epoch, &e.to_string()) else {
                        return;
                    };
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let tap = {
                let Some(mut shared) = core.current(epoch) else { return };
                if let Some(run) = shared.run.as_mut() {
                    run.backoff.record_success();
                    run.configured = false;
                }
                shared.status.state = TransportState::Open;
                shared.status.connection_unstable = false;
                shared.status.consecutive_failures = 0;
                core.publish(&shared);
                core.source.open_tap().map(bridge_tap)
            };
            info!("✅ Realtime session open");

            let exit = match tap {
                Ok(tap) => core.pump(epoch, &mut link, tap).await,
                Err(e) => {
                    error!(error = %e, "❌ Microphone tap unavailable");
                    PumpExit::Terminal(EndReason::DeviceUnavailable)
                }
            };
            drop(link);

            match exit {
                PumpExit::Stale => return,
                PumpExit::Terminal(reason) => {
                    let completion = {
                        let Some(mut shared) = core.current(epoch) else { return };
                        core.finish(&mut shared, reason)
                    };
                    TransportCore::notify(completion);
                    return;
                }
                PumpExit::Lost => {
                    let Some(delay) = core.connection_lost(epoch) else {
                        return;
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn pump(&self, epoch: u64, link: &mut RealtimeLink, mut tap: TapBridge) -> PumpExit {
        loop {
            tokio::select! {
                inbound = link.inbound.recv() => match inbound {
                    Some(text) => {
                        if !self.dispatch(epoch, &text, &link.outbound) {
                            return PumpExit::Stale;
                        }
                    }
                    None => return PumpExit::Lost,
                },
                frame = tap.rx.recv() => match frame {
                    Some(TapFrame::Chunk(chunk)) => {
                        if !self.forward_audio(epoch, &chunk.samples, &link.outbound) {
                            return PumpExit::Stale;
                        }
                    }
                    Some(TapFrame::Fault(CaptureFault::PermissionRevoked)) => {
                        error!("❌ Microphone permission revoked");
                        return PumpExit::Terminal(EndReason::PermissionRevoked);
                    }
                    Some(TapFrame::Fault(CaptureFault::DeviceUnavailable(reason))) => {
                        error!(%reason, "❌ Microphone lost");
                        return PumpExit::Terminal(EndReason::DeviceUnavailable);
                    }
                    Some(TapFrame::Fault(CaptureFault::Transient(reason))) => {
                        warn!(%reason, "capture hiccup");
                    }
                    None => return PumpExit::Terminal(EndReason::DeviceUnavailable),
                },
            }
        }
    }

    /// Mic frames go out unless the interviewer is audible.
    fn forward_audio(&self, epoch: u64, samples: &[f32], outbound: &mpsc::UnboundedSender<String>) -> bool {
        let Some(shared) = self.current(epoch) else {
            return false;
        };
        let speaking = shared.status.interviewer_speaking
            || shared.run.as_ref().map_or(false, |run| run.playback.is_playing());
        if !speaking && !samples.is_empty() {
            let _ = outbound.send(audio_append(samples));
        }
        true
    }

    fn dispatch(&self, epoch: u64, text: &str, outbound: &mpsc::UnboundedSender<String>) -> bool {
        let Some(mut guard) = self.current(epoch) else {
            return false;
        };
        let event = match InboundEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring malformed realtime event");
                return true;
            }
        };

        let shared = &mut *guard;
        let Some(run) = shared.run.as_mut() else {
            return false;
        };
        let status = &mut shared.status;

        match event {
            InboundEvent::SessionCreated => {
                if !run.configured {
                    run.configured = true;
                    let instructions = interviewer_instructions(&run.context);
                    let update = session_update(&self.config, &instructions);
                    let _ = outbound.send(update.to_string());
                    info!("🔧 Realtime session configured");
                }
            }
            InboundEvent::SessionUpdated => debug!("realtime session update acknowledged"),
            InboundEvent::SpeechStarted => {
                debug!("🗣️ Candidate started speaking");
                status.candidate_speaking = true;
            }
            InboundEvent::SpeechStopped => {
                debug!("🤐 Candidate stopped speaking");
                status.candidate_speaking = false;
            }
            InboundEvent::CandidateTranscript { transcript } => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    run.transcript.append(Speaker::Candidate, transcript);
                    run.completed_turns += 1;
                    info!(turn = run.completed_turns, "📝 Candidate: \"{}\"", transcript);
                }
            }
            InboundEvent::TranscriptDelta { delta } => {
                run.pending.push_str(&delta);
                status.interim = Some(run.pending.clone());
            }
            InboundEvent::TranscriptDone { transcript } => {
                let pending = std::mem::take(&mut run.pending);
                let text = if pending.trim().is_empty() { transcript } else { pending };
                let text = text.trim();
                if !text.is_empty() {
                    run.transcript.append(Speaker::Interviewer, text);
                    info!("🔊 Interviewer: \"{}\"", text);
                }
                status.interim = None;
            }
            InboundEvent::AudioDelta { delta } => {
                status.interviewer_speaking = true;
                if let Err(e) = run.playback.push_base64(&delta) {
                    warn!(error = %e, "dropping unplayable audio delta");
                }
            }
            InboundEvent::AudioDone => {
                debug!(chunks = run.playback.queued_chunks(), "interviewer audio complete");
                status.interviewer_speaking = false;
            }
            InboundEvent::Error { error } => {
                warn!(%error, "realtime service reported an error");
                status.last_error = Some(error.to_string());
            }
            InboundEvent::Unknown => debug!("unhandled realtime event"),
        }
        self.publish(shared);
        true
    }

    fn connection_failed(&self, epoch: u64, reason: &str) -> Option<Duration> {
        let mut shared = self.current(epoch)?;
        let delay = self.record_failure(&mut shared);
        warn!(%reason, delay_ms = delay.as_millis() as u64, "realtime connect failed, retrying");
        shared.status.last_error = Some(reason.to_string());
        shared.status.state = TransportState::Closed;
        self.publish(&shared);
        Some(delay)
    }

    /// Connection dropped mid-session: nothing in flight survives.
    fn connection_lost(&self, epoch: u64) -> Option<Duration> {
        let mut shared = self.current(epoch)?;
        if let Some(run) = shared.run.as_mut() {
            if !run.pending.is_empty() {
                debug!(chars = run.pending.len(), "discarding pending interviewer transcript");
            }
            run.pending.clear();
            run.playback.clear();
        }
        let delay = self.record_failure(&mut shared);
        warn!(delay_ms = delay.as_millis() as u64, "🔌 Realtime connection lost, reconnecting");
        shared.status.state = TransportState::Closed;
        shared.status.interim = None;
        shared.status.interviewer_speaking = false;
        shared.status.candidate_speaking = false;
        self.publish(&shared);
        Some(delay)
    }

    fn record_failure(&self, shared: &mut TransportShared) -> Duration {
        let Some(run) = shared.run.as_mut() else {
            return self.policy.base_delay;
        };
        let delay = run.backoff.record_failure();
        let failures = run.backoff.consecutive_failures();
        shared.status.consecutive_failures = failures;
        if failures >= self.unstable_after && !shared.status.connection_unstable {
            warn!(failures, "⚠️ Connection unstable");
            shared.status.connection_unstable = true;
        }
        delay
    }

    fn finish(&self, shared: &mut TransportShared, reason: EndReason) -> Completion {
        let mut run = shared.run.take()?;
        shared.epoch += 1;
        if let Some(task) = run.task.take() {
            task.abort();
        }
        run.pending.clear();
        run.playback.clear();
        self.audio.release_microphone();

        shared.status.state = TransportState::Closed;
        shared.status.end_reason = Some(reason);
        shared.status.interviewer_speaking = false;
        shared.status.candidate_speaking = false;
        shared.status.interim = None;
        self.publish(shared);
        info!(session = %run.session_id, ?reason, "🏁 Realtime interview ended");

        let report = run.report(reason);
        shared.on_complete.clone().map(|callback| (callback, report))
    }
}
