//! Dialogue backend boundary: who decides what the interviewer says next.
//!
//! [`ChatDialogueBackend`] talks to an OpenAI-compatible chat-completions
//! endpoint. [`ScriptedDialogue`] walks a fixed question bank and needs no
//! network at all.

use crate::config::DialogueConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::InterviewContext;
use crate::transcript::{Message, Speaker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One request for the next interviewer utterance.
#[derive(Debug, Clone)]
pub struct DialogueRequest {
    /// Candidate's latest answer; empty for the opening turn.
    pub utterance: String,
    pub context: InterviewContext,
    /// Every message so far, oldest first, including `utterance` when present.
    pub history: Vec<Message>,
}

impl DialogueRequest {
    pub fn opening(context: InterviewContext) -> Self {
        Self {
            utterance: String::new(),
            context,
            history: Vec::new(),
        }
    }

    pub fn is_opening(&self) -> bool {
        self.utterance.is_empty() && self.history.is_empty()
    }
}

/// Produces interviewer utterances. Failures are not retried by the caller.
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn next_utterance(&self, request: &DialogueRequest) -> VoiceResult<String>;
}

/// Interview phase as seen by the prompt.
pub fn interview_phase(history_len: usize) -> &'static str {
    if history_len < 2 {
        "Opening"
    } else if history_len < 10 {
        "Main interview"
    } else {
        "Closing"
    }
}

/// Interviewer persona shared by the chat backend and the realtime session.
pub fn interviewer_instructions(context: &InterviewContext) -> String {
    let mut prompt = format!(
        "You are a professional AI interviewer conducting an interview.\n\n\
         Interview Context:\n\
         - Position: {}\n\
         - Candidate: {}\n\
         - Company: {}\n",
        context.job_title.as_deref().unwrap_or("Not specified"),
        context.candidate_name.as_deref().unwrap_or("Candidate"),
        context.company.as_deref().unwrap_or("the company"),
    );
    for (key, value) in &context.facts {
        prompt.push_str(&format!("- {}: {}\n", key, value));
    }
    prompt.push_str(
        "\nGuidelines:\n\
         - Be friendly, professional, and conversational\n\
         - Ask relevant questions based on the job role\n\
         - Listen actively and ask follow-up questions\n\
         - Keep responses concise (2-3 sentences max)\n\
         - Cover: background, technical skills, problem-solving, and cultural fit\n\
         - Ask 5-7 questions total, then wrap up with \"Thank you for your time\"",
    );
    prompt
}

// OpenAI-compatible request/response
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client (`{api_url}/chat/completions`).
pub struct ChatDialogueBackend {
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl ChatDialogueBackend {
    pub fn new(config: &DialogueConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| VoiceError::Dialogue(e.to_string()))?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.into().trim().to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &DialogueConfig) -> Option<VoiceResult<Self>> {
        let key = config.resolved_api_key()?;
        Some(Self::new(config, key))
    }

    fn build_request(&self, request: &DialogueRequest) -> ChatRequest {
        let system = format!(
            "{}\n\nCurrent phase: {}",
            interviewer_instructions(&request.context),
            interview_phase(request.history.len())
        );
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system,
        });
        messages.extend(request.history.iter().map(|m| ChatMessage {
            role: m.role.chat_role().to_string(),
            content: m.content.clone(),
        }));
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        }
    }
}

#[async_trait]
impl DialogueBackend for ChatDialogueBackend {
    async fn next_utterance(&self, request: &DialogueRequest) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = self.build_request(request);
        debug!(messages = body.messages.len(), model = %self.model, "dialogue request");

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Dialogue(format!("request failed: {}", e)))?;

        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VoiceError::RateLimited(
                "Rate limit exceeded. Please try again later.".to_string(),
            ));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "dialogue backend error");
            return Err(VoiceError::Dialogue(format!("API error {}: {}", status, body)));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Dialogue(format!("response parse failed: {}", e)))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Default offline question bank.
pub const DEFAULT_QUESTIONS: &[&str] = &[
    "Hello! I'm your AI interviewer. Can you tell me about yourself?",
    "What interests you most about this position?",
    "Can you describe a challenging project you've worked on?",
    "How do you handle working under pressure?",
    "Where do you see yourself in the next few years?",
    "Do you have any questions for me?",
    "Thank you for your time! We'll be in touch soon.",
];

/// Offline interviewer. Picks the question by how many interviewer messages
/// the history already holds, and stays on the last entry once the bank is
/// exhausted.
pub struct ScriptedDialogue {
    questions: Vec<String>,
}

impl ScriptedDialogue {
    pub fn new<I, S>(questions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            questions: questions.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for ScriptedDialogue {
    fn default() -> Self {
        Self::new(DEFAULT_QUESTIONS.iter().copied())
    }
}

#[async_trait]
impl DialogueBackend for ScriptedDialogue {
    async fn next_utterance(&self, request: &DialogueRequest) -> VoiceResult<String> {
        if self.questions.is_empty() {
            return Err(VoiceError::Dialogue("question bank is empty".to_string()));
        }
        let asked = request
            .history
            .iter()
            .filter(|m| m.role == Speaker::Interviewer)
            .count();
        let index = asked.min(self.questions.len() - 1);
        Ok(self.questions[index].clone())
    }
}
