//! Transcript Assembler: the append-only message log of one interview.
//!
//! Only completed utterances are appended. Nothing ever edits or reorders an
//! existing [`Message`]; partial text lives in the recognizer or in the
//! transport's pending utterance until it is final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Interviewer,
    Candidate,
}

impl Speaker {
    /// Role name used by OpenAI-compatible chat APIs.
    pub fn chat_role(self) -> &'static str {
        match self {
            Speaker::Interviewer => "assistant",
            Speaker::Candidate => "user",
        }
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::Interviewer => write!(f, "interviewer"),
            Speaker::Candidate => write!(f, "candidate"),
        }
    }
}

/// One final utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Writable log, owned by exactly one session.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed utterance. Timestamps never go backwards within a log.
    pub fn append(&self, role: Speaker, text: impl Into<String>) -> Message {
        let mut messages = self.write();
        let mut timestamp = Utc::now();
        if let Some(last) = messages.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        let message = Message {
            role,
            content: text.into(),
            timestamp,
        };
        messages.push(message.clone());
        message
    }

    /// Read-only view that can be handed to UI code.
    pub fn reader(&self) -> TranscriptReader {
        TranscriptReader {
            messages: Arc::clone(&self.messages),
        }
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        self.messages.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        self.messages.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Concurrent read access to a [`TranscriptLog`] (live transcript display).
#[derive(Debug, Clone)]
pub struct TranscriptReader {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl TranscriptReader {
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.messages
            .read()
            .map(|m| m.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Message> {
        self.snapshot().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order() {
        let log = TranscriptLog::new();
        log.append(Speaker::Interviewer, "Tell me about yourself");
        log.append(Speaker::Candidate, "I have five years of experience");
        log.append(Speaker::Interviewer, "What interests you about this role?");

        let messages = log.snapshot();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Speaker::Interviewer);
        assert_eq!(messages[1].content, "I have five years of experience");
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn reader_sees_later_appends_but_old_entries_are_stable() {
        let log = TranscriptLog::new();
        let reader = log.reader();
        let first = log.append(Speaker::Interviewer, "Hello");
        assert_eq!(reader.len(), 1);

        log.append(Speaker::Candidate, "Hi");
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.snapshot()[0], first);
        assert_eq!(reader.last().map(|m| m.role), Some(Speaker::Candidate));
    }

    #[test]
    fn speaker_serializes_lowercase() {
        let json = serde_json::to_string(&Speaker::Candidate).unwrap();
        assert_eq!(json, "\"candidate\"");
        assert_eq!(Speaker::Interviewer.chat_role(), "assistant");
    }
}
