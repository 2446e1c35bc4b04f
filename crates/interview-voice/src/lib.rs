//! # Interview Voice - turn-taking for spoken interviews
//!
//! Drives a spoken, turn-based interview between an automated interviewer and
//! a candidate on top of unreliable speech primitives, or alternatively over
//! a realtime streaming service.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Interview Orchestrator                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Audio In   │→ │  Recognizer  │→ │  state machine       │   │
//! │  │    (cpal)    │  │ VAD + STT    │  │  (one event channel) │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │         ↑                 ↑ backoff          │        ↓          │
//! │  ┌──────────────┐         │           ┌──────────────┐           │
//! │  │  Audio Out   │←── TTS ─┴───────────│   Dialogue   │           │
//! │  │   (rodio)    │                     │   backend    │           │
//! │  └──────────────┘                     └──────────────┘           │
//! │                  TranscriptLog (append-only)                     │
//! └──────────────────────────────────────────────────────────────────┘
//!
//!   Realtime mode:  mic ⇄ RealtimeSession ⇄ WebSocket ⇄ realtime service
//! ```

pub mod audio;
pub mod backoff;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod orchestrator;
pub mod recognizer;
pub mod segmenter;
pub mod session;
pub mod stt;
pub mod transcript;
pub mod transport;
pub mod vad;
pub mod voice_output;

pub use audio::{
    bridge_tap, AudioChunk, AudioConfig, AudioIo, AudioSource, CaptureFault, DeviceAudio, PcmSink,
    SpeechCapabilities, TapFrame,
};
pub use backoff::{Backoff, BackoffPolicy};
pub use config::{
    BackoffConfig, CaptureConfig, DialogueConfig, InterviewConfig, SpeechServiceConfig, TransportConfig,
};
pub use dialogue::{
    interviewer_instructions, ChatDialogueBackend, DialogueBackend, DialogueRequest, ScriptedDialogue,
};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::{InterviewHandle, InterviewOrchestrator};
pub use recognizer::{BufferedRecognizer, LiveRecognizer};
pub use segmenter::{SegmentEvent, SegmenterConfig, UtteranceSegmenter};
pub use session::{
    CompletionReport, ConversationSession, EndReason, InterviewContext, InterviewState, OnComplete,
    SessionStatus,
};
pub use stt::{
    create_best_stt, FragmentSink, OpenAiStt, PlaceholderStt, RecognitionError, RecognitionFragment,
    RecognitionMode, SpeechRecognizer, SttBackend,
};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use transcript::{Message, Speaker, TranscriptLog, TranscriptReader};
pub use transport::{
    InboundEvent, PlaybackQueue, RealtimeConnector, RealtimeHandle, RealtimeLink, RealtimeSession,
    TransportState, TransportStatus, WebSocketConnector,
};
pub use vad::{VadConfig, VadDetector};
pub use voice_output::{OpenAiTts, PlaceholderTts, TtsBackend, VoiceOutput};
