//! Scripted adapters shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use interview_voice::{
    AudioIo, AudioSource, CompletionReport, DialogueBackend, DialogueRequest, FragmentSink, PcmSink,
    RecognitionError, RecognitionMode, SpeechCapabilities, SpeechRecognizer, TapFrame, VoiceError,
    VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Ordered record of what the adapters were asked to do.
pub type Timeline = Arc<Mutex<Vec<String>>>;

pub fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

pub struct MockAudio {
    capabilities: SpeechCapabilities,
    acquire_error: Option<VoiceError>,
    hang_on_acquire: bool,
    speak_delay: Duration,
    sample_rate: u32,
    timeline: Timeline,
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub stops: AtomicUsize,
    taps: Mutex<Vec<std_mpsc::Sender<TapFrame>>>,
    pub played: Mutex<Vec<Vec<i16>>>,
    pub clears: AtomicUsize,
}

impl MockAudio {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            capabilities: SpeechCapabilities::full(),
            acquire_error: None,
            hang_on_acquire: false,
            speak_delay: Duration::from_secs(1),
            sample_rate: 16000,
            timeline,
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            taps: Mutex::new(Vec::new()),
            played: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
        }
    }

    pub fn speak_delay(mut self, delay: Duration) -> Self {
        self.speak_delay = delay;
        self
    }

    pub fn deny_microphone(mut self, err: VoiceError) -> Self {
        self.acquire_error = Some(err);
        self
    }

    pub fn hang_on_acquire(mut self) -> Self {
        self.hang_on_acquire = true;
        self
    }

    pub fn capabilities(mut self, caps: SpeechCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Push a frame to every open tap.
    pub fn send_frame(&self, frame: TapFrame) {
        self.taps
            .lock()
            .unwrap()
            .retain(|tap| tap.send(frame.clone()).is_ok());
    }

    pub fn open_taps(&self) -> usize {
        self.taps.lock().unwrap().len()
    }

    fn note(&self, entry: String) {
        self.timeline.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl AudioIo for MockAudio {
    fn capabilities(&self) -> SpeechCapabilities {
        self.capabilities
    }

    async fn acquire_microphone(&self) -> VoiceResult<()> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_acquire {
            std::future::pending::<()>().await;
        }
        match &self.acquire_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn release_microphone(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn speak(&self, text: &str) -> VoiceResult<()> {
        self.note(format!("speak_start:{}", text));
        tokio::time::sleep(self.speak_delay).await;
        self.note(format!("speak_end:{}", text));
        Ok(())
    }

    fn stop_playback(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl AudioSource for MockAudio {
    fn open_tap(&self) -> VoiceResult<std_mpsc::Receiver<TapFrame>> {
        let (tx, rx) = std_mpsc::channel();
        self.taps.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl PcmSink for MockAudio {
    fn enqueue_pcm16(&self, samples: Vec<i16>, _sample_rate: u32) -> VoiceResult<()> {
        self.played.lock().unwrap().push(samples);
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }
}

/// What one `listen` call does.
#[derive(Debug, Clone)]
pub enum Step {
    Final(String),
    /// Several finals out of one capture window.
    Finals(Vec<String>),
    Interim(String),
    Fail(RecognitionError),
    Hang,
}

pub struct MockRecognizer {
    steps: Mutex<VecDeque<Step>>,
    timeline: Timeline,
    calls: Mutex<Vec<Instant>>,
}

impl MockRecognizer {
    pub fn new(timeline: Timeline, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            timeline,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    fn mode(&self) -> RecognitionMode {
        RecognitionMode::Live
    }

    async fn listen(&self, sink: FragmentSink) -> Result<(), RecognitionError> {
        self.calls.lock().unwrap().push(Instant::now());
        self.timeline.lock().unwrap().push("listen".to_string());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Hang);
        match step {
            Step::Final(text) => {
                sink.final_text(text);
                Ok(())
            }
            Step::Finals(texts) => {
                for text in texts {
                    sink.final_text(text);
                }
                Ok(())
            }
            Step::Interim(text) => {
                sink.interim(text);
                std::future::pending().await
            }
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub struct MockDialogue {
    replies: Mutex<VecDeque<VoiceResult<String>>>,
    delay: Duration,
    pub requests: Mutex<Vec<DialogueRequest>>,
}

impl MockDialogue {
    pub fn new(replies: impl IntoIterator<Item = VoiceResult<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<DialogueRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogueBackend for MockDialogue {
    async fn next_utterance(&self, request: &DialogueRequest) -> VoiceResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Tell me more.".to_string()))
    }
}

/// Collects completion reports.
pub fn completion_log() -> (Arc<Mutex<Vec<CompletionReport>>>, impl Fn(CompletionReport) + Send + Sync) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |report| sink.lock().unwrap().push(report))
}

/// Poll `check` on the (paused) clock until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
