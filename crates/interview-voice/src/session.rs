//! Session data: interview context, turn-taking state, observable status and
//! the completion report handed to the surrounding application.

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::VoiceError;
use crate::transcript::{Message, TranscriptLog};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Static facts about the interview, fixed for the whole session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterviewContext {
    pub candidate_name: Option<String>,
    pub job_title: Option<String>,
    pub company: Option<String>,
    /// Ordered resume / job facts passed to the interviewer prompt.
    #[serde(default)]
    pub facts: Vec<(String, String)>,
}

impl InterviewContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candidate(mut self, name: impl Into<String>) -> Self {
        self.candidate_name = Some(name.into());
        self
    }

    pub fn job_title(mut self, title: impl Into<String>) -> Self {
        self.job_title = Some(title.into());
        self
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.push((key.into(), value.into()));
        self
    }
}

/// Turn-taking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterviewState {
    #[default]
    Idle,
    /// Interviewer is producing or speaking the opening utterance.
    Greeting,
    ListeningForCandidate,
    /// Waiting out a backoff delay before capture restarts.
    Reconnecting,
    /// Waiting for the dialogue backend.
    ProcessingResponse,
    Speaking,
    Ended,
}

impl std::fmt::Display for InterviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InterviewState::Idle => "idle",
            InterviewState::Greeting => "greeting",
            InterviewState::ListeningForCandidate => "listening",
            InterviewState::Reconnecting => "reconnecting",
            InterviewState::ProcessingResponse => "processing",
            InterviewState::Speaking => "speaking",
            InterviewState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why a session reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Requested,
    MaxTurnsReached,
    PermissionDenied,
    PermissionRevoked,
    DeviceUnavailable,
    CapabilityMissing,
}

impl EndReason {
    /// End reason for a terminal startup error.
    pub fn from_startup_error(err: &VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(_) => EndReason::PermissionDenied,
            VoiceError::CapabilityMissing(_) => EndReason::CapabilityMissing,
            _ => EndReason::DeviceUnavailable,
        }
    }
}

/// Snapshot published to observers (indicator lights, live transcript UI).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub state: InterviewState,
    pub interviewer_speaking: bool,
    pub capturing: bool,
    /// Set once consecutive capture failures pass the configured threshold.
    pub connection_unstable: bool,
    /// Latest interim recognition text of the utterance in progress.
    pub interim: Option<String>,
    pub last_error: Option<String>,
    pub end_reason: Option<EndReason>,
}

/// Delivered once when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub session_id: Uuid,
    pub reason: EndReason,
    pub context: InterviewContext,
    pub transcript: Vec<Message>,
    pub completed_turns: u32,
}

/// Callback invoked with the [`CompletionReport`].
pub type OnComplete = Arc<dyn Fn(CompletionReport) + Send + Sync>;

/// One interview run, owned by the orchestrator.
#[derive(Debug)]
pub struct ConversationSession {
    pub id: Uuid,
    pub context: InterviewContext,
    pub transcript: TranscriptLog,
    pub state: InterviewState,
    /// Recognition channel backoff.
    pub backoff: Backoff,
    /// Cleared on teardown; no capture is armed or scheduled afterwards.
    pub should_continue: bool,
    pub completed_turns: u32,
    /// The closing line is being spoken; the session ends when it finishes.
    pub closing: bool,
}

impl ConversationSession {
    pub fn new(context: InterviewContext, policy: BackoffPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            transcript: TranscriptLog::new(),
            state: InterviewState::Idle,
            backoff: Backoff::new(policy),
            should_continue: true,
            completed_turns: 0,
            closing: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != InterviewState::Ended
    }

    pub fn report(&self, reason: EndReason) -> CompletionReport {
        CompletionReport {
            session_id: self.id,
            reason,
            context: self.context.clone(),
            transcript: self.transcript.snapshot(),
            completed_turns: self.completed_turns,
        }
    }
}
