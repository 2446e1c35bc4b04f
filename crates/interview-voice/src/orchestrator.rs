//! Turn-Taking Orchestrator - the coordination layer of an interview.
//!
//! Owns the [`ConversationSession`] and decides who talks. Every asynchronous
//! step (microphone permission, a capture window, a dialogue request,
//! playback, a backoff timer) runs as a tracked task that reports back over a
//! single event channel. One driver task feeds those events to the
//! state-transition functions, which run under the session lock, so two
//! handlers never run at the same time.
//!
//! Each task is stamped with the epoch current when it was spawned. Stopping
//! capture, accepting an answer and ending the session all bump the epoch,
//! so late completions from cancelled work are dropped on arrival.

use crate::audio::AudioIo;
use crate::backoff::BackoffPolicy;
use crate::config::InterviewConfig;
use crate::dialogue::{DialogueBackend, DialogueRequest};
use crate::error::{VoiceError, VoiceResult};
use crate::session::{
    CompletionReport, ConversationSession, EndReason, InterviewContext, InterviewState, OnComplete,
    SessionStatus,
};
use crate::stt::{FragmentSink, RecognitionError, RecognitionFragment, SpeechRecognizer};
use crate::transcript::{Speaker, TranscriptReader};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Completions reported back to the driver.
#[derive(Debug)]
enum SessionEvent {
    Recognition {
        epoch: u64,
        fragment: RecognitionFragment,
    },
    CaptureFinished {
        epoch: u64,
        result: Result<(), RecognitionError>,
    },
    DialogueReply {
        epoch: u64,
        result: VoiceResult<String>,
    },
    PlaybackFinished {
        epoch: u64,
        result: VoiceResult<()>,
    },
    RestartCapture {
        epoch: u64,
    },
}

impl SessionEvent {
    fn epoch(&self) -> u64 {
        match self {
            SessionEvent::Recognition { epoch, .. }
            | SessionEvent::CaptureFinished { epoch, .. }
            | SessionEvent::DialogueReply { epoch, .. }
            | SessionEvent::PlaybackFinished { epoch, .. }
            | SessionEvent::RestartCapture { epoch } => *epoch,
        }
    }
}

type Completion = Option<(OnComplete, CompletionReport)>;

#[derive(Default)]
struct Shared {
    session: Option<ConversationSession>,
    epoch: u64,
    tasks: Vec<AbortHandle>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    driver: Option<AbortHandle>,
    status: SessionStatus,
    on_complete: Option<OnComplete>,
    // lets on_final_utterance() be called from non-runtime threads
    runtime: Option<Handle>,
}

impl Shared {
    fn state(&self) -> Option<InterviewState> {
        self.session.as_ref().map(|s| s.state)
    }

    fn set_state(&mut self, state: InterviewState) {
        if let Some(session) = self.session.as_mut() {
            debug!(from = %session.state, to = %state, "state transition");
            session.state = state;
        }
    }

    fn spawn_tracked<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        self.tasks.retain(|h| !h.is_finished());
        let handle = runtime.spawn(task);
        self.tasks.push(handle.abort_handle());
    }

    /// Abort every in-flight task and invalidate anything already queued.
    fn cancel_inflight(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.epoch += 1;
    }
}

struct Core {
    config: InterviewConfig,
    audio: Arc<dyn AudioIo>,
    recognizer: Arc<dyn SpeechRecognizer>,
    dialogue: Arc<dyn DialogueBackend>,
    shared: Mutex<Shared>,
    status_tx: watch::Sender<SessionStatus>,
}

/// What `start()` hands back to the caller.
#[derive(Debug, Clone)]
pub struct InterviewHandle {
    pub session_id: Uuid,
    /// Live, read-only message log.
    pub transcript: TranscriptReader,
    pub status: watch::Receiver<SessionStatus>,
}

/// Drives one interview at a time through its turns.
pub struct InterviewOrchestrator {
    core: Arc<Core>,
}

impl InterviewOrchestrator {
    pub fn new(
        config: InterviewConfig,
        audio: Arc<dyn AudioIo>,
        recognizer: Arc<dyn SpeechRecognizer>,
        dialogue: Arc<dyn DialogueBackend>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        info!(
            max_turns = config.max_turns,
            mode = ?recognizer.mode(),
            "🎭 Interview orchestrator ready"
        );
        Self {
            core: Arc::new(Core {
                config,
                audio,
                recognizer,
                dialogue,
                shared: Mutex::new(Shared::default()),
                status_tx,
            }),
        }
    }

    /// Register the completion callback. Called once per session, outside
    /// the session lock.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: Fn(CompletionReport) + Send + Sync + 'static,
    {
        self.core.lock().on_complete = Some(Arc::new(callback));
        self
    }

    /// Start a new interview: capability check, microphone permission, then
    /// the opening utterance. Fails with `SessionActive` while another
    /// session is running.
    pub async fn start(&self, context: InterviewContext) -> VoiceResult<InterviewHandle> {
        let core = &self.core;

        if let Err(e) = core.audio.capabilities().require_all() {
            error!(error = %e, "❌ Cannot start interview");
            return Err(e);
        }

        let (session_id, transcript, epoch, acquire) = {
            let mut shared = core.lock();
            if shared.session.as_ref().map_or(false, |s| s.is_active()) {
                warn!("start() rejected, a session is already active");
                return Err(VoiceError::SessionActive);
            }

            let session = ConversationSession::new(context, BackoffPolicy::from(&core.config.backoff));
            let session_id = session.id;
            let transcript = session.transcript.reader();

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            shared.epoch += 1;
            shared.runtime = Some(Handle::current());
            shared.session = Some(session);
            shared.events = Some(events_tx);
            shared.status = SessionStatus {
                session_id: Some(session_id),
                ..SessionStatus::default()
            };

            let driver = tokio::spawn(Core::drive(Arc::clone(core), events_rx));
            shared.driver = Some(driver.abort_handle());

            let audio = Arc::clone(&core.audio);
            let acquire = tokio::spawn(async move { audio.acquire_microphone().await });
            shared.tasks.push(acquire.abort_handle());
            core.publish(&mut shared);

            (session_id, transcript, shared.epoch, acquire)
        };

        info!(session = %session_id, "🎬 Interview starting, requesting microphone");
        let acquired = acquire.await;

        let mut completion = None;
        let outcome = {
            let mut shared = core.lock();
            let current = shared.epoch == epoch
                && shared
                    .session
                    .as_ref()
                    .map_or(false, |s| s.id == session_id && s.is_active());

            let outcome = match acquired {
                Ok(Ok(())) if current => {
                    info!(session = %session_id, "🎤 Microphone ready");
                    core.begin_greeting(&mut shared);
                    Ok(())
                }
                Ok(Ok(())) => {
                    // end() won the race; hand the device straight back
                    core.audio.release_microphone();
                    Err(VoiceError::SessionEnded)
                }
                _ if !current => Err(VoiceError::SessionEnded),
                Ok(Err(e)) => {
                    error!(error = %e, "❌ Microphone unavailable");
                    shared.status.last_error = Some(e.to_string());
                    completion = core.finish(&mut shared, EndReason::from_startup_error(&e));
                    Err(e)
                }
                Err(join_err) => {
                    let e = VoiceError::AudioDevice(format!("microphone request failed: {}", join_err));
                    shared.status.last_error = Some(e.to_string());
                    completion = core.finish(&mut shared, EndReason::DeviceUnavailable);
                    Err(e)
                }
            };
            core.publish(&mut shared);
            outcome
        };
        Core::notify(completion);
        outcome?;

        Ok(InterviewHandle {
            session_id,
            transcript,
            status: core.status_tx.subscribe(),
        })
    }

    /// Deliver a final candidate utterance. Accepted only while listening;
    /// returns whether it was.
    pub fn on_final_utterance(&self, text: &str) -> bool {
        let mut shared = self.core.lock();
        let accepted = self.core.accept_final(&mut shared, text);
        if accepted {
            self.core.publish(&mut shared);
        }
        accepted
    }

    /// Stop everything and move to `Ended`. Idempotent, safe from any state,
    /// and synchronous: nothing spawned by the session runs afterwards.
    pub fn end(&self) {
        let completion = {
            let mut shared = self.core.lock();
            self.core.finish(&mut shared, EndReason::Requested)
        };
        Core::notify(completion);
    }

    pub fn state(&self) -> InterviewState {
        self.core.lock().state().unwrap_or_default()
    }

    /// Read-only log of the current (or last) session.
    pub fn transcript(&self) -> Option<TranscriptReader> {
        self.core
            .lock()
            .session
            .as_ref()
            .map(|s| s.transcript.reader())
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.core.status_tx.subscribe()
    }
}

impl Drop for InterviewOrchestrator {
    fn drop(&mut self) {
        self.end();
    }
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, shared: &mut Shared) {
        if let Some(state) = shared.state() {
            shared.status.state = state;
        }
        self.status_tx.send_replace(shared.status.clone());
    }

    fn notify(completion: Completion) {
        if let Some((callback, report)) = completion {
            callback(report);
        }
    }

    async fn drive(core: Arc<Core>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let completion = core.handle(event);
            Core::notify(completion);
        }
        debug!("session driver exiting");
    }

    fn handle(&self, event: SessionEvent) -> Completion {
        let mut shared = self.lock();
        let Some(state) = shared.state() else {
            return None;
        };

        if event.epoch() != shared.epoch || state == InterviewState::Ended {
            match event {
                SessionEvent::Recognition { fragment, .. } if fragment.is_final => {
                    warn!(text = %fragment.text, "discarding late final fragment");
                }
                other => debug!(?other, "dropping stale event"),
            }
            return None;
        }

        let completion = match event {
            SessionEvent::Recognition { fragment, .. } => {
                if fragment.is_final {
                    self.accept_final(&mut shared, &fragment.text);
                } else if state == InterviewState::ListeningForCandidate {
                    shared.status.interim = Some(fragment.text);
                }
                None
            }
            SessionEvent::CaptureFinished { result, .. } => self.capture_finished(&mut shared, result),
            SessionEvent::DialogueReply { result, .. } => {
                self.dialogue_reply(&mut shared, result);
                None
            }
            SessionEvent::PlaybackFinished { result, .. } => self.playback_finished(&mut shared, result),
            SessionEvent::RestartCapture { .. } => {
                if matches!(
                    state,
                    InterviewState::ListeningForCandidate | InterviewState::Reconnecting
                ) {
                    self.restart_capture(&mut shared);
                }
                None
            }
        };
        self.publish(&mut shared);
        completion
    }

    fn begin_greeting(&self, shared: &mut Shared) {
        shared.set_state(InterviewState::Greeting);
        let greeting = self
            .config
            .greeting
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string);

        match greeting {
            Some(text) => self.say(shared, text),
            None => {
                let Some(context) = shared.session.as_ref().map(|s| s.context.clone()) else {
                    return;
                };
                self.request_reply(shared, DialogueRequest::opening(context));
            }
        }
    }

    fn accept_final(&self, shared: &mut Shared, text: &str) -> bool {
        let Some(state) = shared.state() else {
            return false;
        };
        if state != InterviewState::ListeningForCandidate {
            warn!(%state, text, "ignoring final utterance, not listening");
            return false;
        }
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        // stops the capture window and any pending restart
        shared.cancel_inflight();
        shared.status.capturing = false;
        shared.status.interim = None;
        shared.status.connection_unstable = false;

        let Some(session) = shared.session.as_mut() else {
            return false;
        };
        session.transcript.append(Speaker::Candidate, text);
        session.completed_turns += 1;
        session.backoff.record_success();
        let turns = session.completed_turns;
        info!(turn = turns, "🗣️ Candidate answered: \"{}\"", text);

        if turns >= self.config.max_turns {
            info!(turns, "🏁 Turn limit reached, closing the interview");
            session.closing = true;
            session.state = InterviewState::Speaking;
            let closing = self.config.closing_line.clone();
            self.say(shared, closing);
            return true;
        }

        session.state = InterviewState::ProcessingResponse;
        let request = DialogueRequest {
            utterance: text.to_string(),
            context: session.context.clone(),
            history: session.transcript.snapshot(),
        };
        self.request_reply(shared, request);
        true
    }

    fn capture_finished(&self, shared: &mut Shared, result: Result<(), RecognitionError>) -> Completion {
        if shared.state() != Some(InterviewState::ListeningForCandidate) {
            return None;
        }
        shared.status.capturing = false;
        shared.status.interim = None;

        match result {
            Ok(()) | Err(RecognitionError::NoSpeechDetected) => {
                let delay = shared
                    .session
                    .as_ref()
                    .map(|s| s.backoff.policy().base_delay)
                    .unwrap_or_default();
                debug!("no speech in this window, listening again");
                self.schedule_restart(shared, delay);
                None
            }
            Err(RecognitionError::TransientFailure(reason)) => {
                let Some(session) = shared.session.as_mut() else {
                    return None;
                };
                let delay = session.backoff.record_failure();
                let failures = session.backoff.consecutive_failures();
                session.state = InterviewState::Reconnecting;
                warn!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "recognition failed, restarting after backoff"
                );
                if failures >= self.config.unstable_after && !shared.status.connection_unstable {
                    warn!(failures, "⚠️ Connection unstable");
                    shared.status.connection_unstable = true;
                }
                self.schedule_restart(shared, delay);
                None
            }
            Err(err @ RecognitionError::PermissionRevoked) => {
                error!("❌ Microphone permission revoked");
                shared.status.last_error = Some(err.to_string());
                self.finish(shared, EndReason::PermissionRevoked)
            }
            Err(err @ RecognitionError::DeviceUnavailable(_)) => {
                error!(error = %err, "❌ Microphone lost");
                shared.status.last_error = Some(err.to_string());
                self.finish(shared, EndReason::DeviceUnavailable)
            }
        }
    }

    fn dialogue_reply(&self, shared: &mut Shared, result: VoiceResult<String>) {
        let Some(state) = shared.state() else {
            return;
        };
        if !matches!(state, InterviewState::Greeting | InterviewState::ProcessingResponse) {
            return;
        }

        let text = match result {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!("dialogue backend returned nothing, using fallback reply");
                self.config.fallback_reply.clone()
            }
            Err(e) => {
                error!(error = %e, "❌ Dialogue backend failed");
                shared.status.last_error = Some(e.to_string());
                if state == InterviewState::Greeting {
                    self.config.opening_line.clone()
                } else {
                    // turn abandoned; the candidate gets the floor back
                    if let Some(session) = shared.session.as_mut() {
                        session.completed_turns = session.completed_turns.saturating_sub(1);
                    }
                    self.start_capture(shared);
                    return;
                }
            }
        };

        if state == InterviewState::ProcessingResponse {
            shared.set_state(InterviewState::Speaking);
        }
        self.say(shared, text);
    }

    fn playback_finished(&self, shared: &mut Shared, result: VoiceResult<()>) -> Completion {
        let Some(state) = shared.state() else {
            return None;
        };
        if !matches!(state, InterviewState::Greeting | InterviewState::Speaking) {
            return None;
        }
        if let Err(e) = result {
            warn!(error = %e, "speech synthesis failed, continuing");
        }
        shared.status.interviewer_speaking = false;

        if shared.session.as_ref().map_or(false, |s| s.closing) {
            return self.finish(shared, EndReason::MaxTurnsReached);
        }
        self.start_capture(shared);
        None
    }

    /// Append an interviewer message and play it.
    fn say(&self, shared: &mut Shared, text: String) {
        let Some(events) = shared.events.clone() else {
            return;
        };
        if let Some(session) = shared.session.as_ref() {
            session.transcript.append(Speaker::Interviewer, text.as_str());
        }
        info!("🔊 Interviewer: \"{}\"", text);
        shared.status.interviewer_speaking = true;
        shared.status.capturing = false;

        let epoch = shared.epoch;
        let audio = Arc::clone(&self.audio);
        shared.spawn_tracked(async move {
            let result = audio.speak(&text).await;
            let _ = events.send(SessionEvent::PlaybackFinished { epoch, result });
        });
    }

    fn request_reply(&self, shared: &mut Shared, request: DialogueRequest) {
        let Some(events) = shared.events.clone() else {
            return;
        };
        debug!(history = request.history.len(), "requesting interviewer reply");
        let epoch = shared.epoch;
        let dialogue = Arc::clone(&self.dialogue);
        shared.spawn_tracked(async move {
            let result = dialogue.next_utterance(&request).await;
            let _ = events.send(SessionEvent::DialogueReply { epoch, result });
        });
    }

    /// Re-arm capture once the backoff window has passed.
    fn restart_capture(&self, shared: &mut Shared) {
        let Some(session) = shared.session.as_ref() else {
            return;
        };
        let now = tokio::time::Instant::now();
        if session.backoff.is_suppressed(now) {
            let remaining = session
                .backoff
                .suppress_until()
                .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));
            debug!(remaining_ms = remaining.as_millis() as u64, "restart still held back");
            self.schedule_restart(shared, remaining);
            return;
        }
        self.start_capture(shared);
    }

    /// Arm one capture window. Capture is never armed while the interviewer
    /// is speaking.
    fn start_capture(&self, shared: &mut Shared) {
        if !shared.session.as_ref().map_or(false, |s| s.should_continue) {
            return;
        }
        let Some(events) = shared.events.clone() else {
            return;
        };
        shared.set_state(InterviewState::ListeningForCandidate);
        shared.status.capturing = true;
        shared.status.interim = None;

        let epoch = shared.epoch;
        let recognizer = Arc::clone(&self.recognizer);
        shared.spawn_tracked(async move {
            let (sink, mut fragments) = FragmentSink::channel();
            let mut listen = recognizer.listen(sink);
            let result = loop {
                tokio::select! {
                    Some(fragment) = fragments.recv() => {
                        let _ = events.send(SessionEvent::Recognition { epoch, fragment });
                    }
                    result = &mut listen => break result,
                }
            };
            while let Ok(fragment) = fragments.try_recv() {
                let _ = events.send(SessionEvent::Recognition { epoch, fragment });
            }
            let _ = events.send(SessionEvent::CaptureFinished { epoch, result });
        });
        debug!("👂 Capture armed");
    }

    fn schedule_restart(&self, shared: &mut Shared, delay: Duration) {
        if !shared.session.as_ref().map_or(false, |s| s.should_continue) {
            return;
        }
        let Some(events) = shared.events.clone() else {
            return;
        };
        let epoch = shared.epoch;
        shared.spawn_tracked(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::RestartCapture { epoch });
        });
    }

    /// Tear the session down. Returns the completion to deliver once the
    /// lock is released; `None` if the session had already ended.
    fn finish(&self, shared: &mut Shared, reason: EndReason) -> Completion {
        if !shared.session.as_ref().map_or(false, |s| s.is_active()) {
            return None;
        }

        shared.cancel_inflight();
        if let Some(driver) = shared.driver.take() {
            driver.abort();
        }
        shared.events = None;
        self.audio.stop_playback();
        self.audio.release_microphone();

        shared.status.end_reason = Some(reason);
        shared.status.interviewer_speaking = false;
        shared.status.capturing = false;
        shared.status.interim = None;

        let session = shared.session.as_mut()?;
        session.state = InterviewState::Ended;
        session.should_continue = false;
        info!(session = %session.id, ?reason, turns = session.completed_turns, "🏁 Interview ended");

        let report = session.report(reason);
        self.publish(shared);
        shared.on_complete.clone().map(|callback| (callback, report))
    }
}
