//! Interview console: runs one voice interview against the default audio
//! devices and prints the transcript report when it ends.
//!
//! Candidate details come from `INTERVIEW_CANDIDATE`, `INTERVIEW_JOB_TITLE`
//! and `INTERVIEW_COMPANY`; a positional argument overrides the job title.

use anyhow::Context;
use interview_voice::{
    create_best_stt, AudioConfig, BufferedRecognizer, ChatDialogueBackend, CompletionReport,
    DeviceAudio, DialogueBackend, InterviewConfig, InterviewContext, InterviewOrchestrator,
    InterviewState, LiveRecognizer, OpenAiTts, PlaceholderTts, RealtimeSession, RecognitionMode,
    ScriptedDialogue, SpeechRecognizer, SttBackend, TtsBackend, WebSocketConnector,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[interview-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = InterviewConfig::load().context("loading interview config")?;
    let context = context_from_env();

    let tts: Arc<dyn TtsBackend> = match OpenAiTts::from_config(&config.speech) {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            tracing::warn!(error = %e, "speech synthesis disabled, interviewer will be silent");
            Arc::new(PlaceholderTts)
        }
    };

    let (done_tx, done_rx) = oneshot::channel::<CompletionReport>();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    let on_complete = move |report: CompletionReport| {
        if let Some(tx) = done_tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(report);
        }
    };

    if config.transport.enabled {
        run_realtime(config, tts, context, on_complete, done_rx).await
    } else {
        run_local(config, tts, context, on_complete, done_rx).await
    }
}

fn context_from_env() -> InterviewContext {
    let mut context = InterviewContext::new();
    if let Ok(name) = std::env::var("INTERVIEW_CANDIDATE") {
        context = context.candidate(name);
    }
    let job_title = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("INTERVIEW_JOB_TITLE").ok());
    if let Some(title) = job_title {
        context = context.job_title(title);
    }
    if let Ok(company) = std::env::var("INTERVIEW_COMPANY") {
        context = context.company(company);
    }
    context
}

async fn run_local(
    config: InterviewConfig,
    tts: Arc<dyn TtsBackend>,
    context: InterviewContext,
    on_complete: impl Fn(CompletionReport) + Send + Sync + 'static,
    done_rx: oneshot::Receiver<CompletionReport>,
) -> anyhow::Result<()> {
    let audio = Arc::new(DeviceAudio::new(
        AudioConfig {
            sample_rate: config.capture.sample_rate,
            channels: 1,
            buffer_size: config.capture.chunk_size,
        },
        tts,
    ));
    let stt: Arc<dyn SttBackend> = Arc::from(create_best_stt(&config.speech));
    let recognizer: Arc<dyn SpeechRecognizer> = match config.capture.mode {
        RecognitionMode::Live => Arc::new(LiveRecognizer::new(audio.clone(), stt, config.capture.clone())),
        RecognitionMode::Buffered => Arc::new(BufferedRecognizer::new(audio.clone(), stt, &config.capture)),
    };
    let dialogue: Arc<dyn DialogueBackend> = match ChatDialogueBackend::from_config(&config.dialogue) {
        Some(Ok(backend)) => Arc::new(backend),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "dialogue backend unavailable, using scripted questions");
            Arc::new(ScriptedDialogue::default())
        }
        None => {
            tracing::info!("no dialogue API key configured, using scripted questions");
            Arc::new(ScriptedDialogue::default())
        }
    };

    let orchestrator = InterviewOrchestrator::new(config, audio, recognizer, dialogue).on_complete(on_complete);
    let handle = orchestrator.start(context).await.context("starting interview")?;
    tracing::info!(session = %handle.session_id, "Interview running, CTRL-C to end");

    let mut status = handle.status.clone();
    let mut printed = 0;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                for message in handle.transcript.snapshot().iter().skip(printed) {
                    println!("[{}] {}", message.role, message.content);
                    printed += 1;
                }
                if snapshot.connection_unstable {
                    tracing::warn!("connection unstable, still trying");
                }
                if snapshot.state == InterviewState::Ended {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; ending interview");
                break;
            }
        }
    }

    orchestrator.end();
    print_report(done_rx).await
}

async fn run_realtime(
    config: InterviewConfig,
    tts: Arc<dyn TtsBackend>,
    context: InterviewContext,
    on_complete: impl Fn(CompletionReport) + Send + Sync + 'static,
    done_rx: oneshot::Receiver<CompletionReport>,
) -> anyhow::Result<()> {
    let rate = config.transport.sample_rate;
    let audio = Arc::new(DeviceAudio::new(
        AudioConfig {
            sample_rate: rate,
            channels: 1,
            buffer_size: (rate / 50) as usize,
        },
        tts,
    ));
    let connector = Arc::new(WebSocketConnector::from_config(&config.transport).context("realtime connector")?);
    let session = RealtimeSession::new(&config, connector, audio.clone(), audio.clone(), audio)
        .on_complete(on_complete);
    let handle = session.start(context).await.context("starting realtime interview")?;
    tracing::info!(session = %handle.session_id, "Realtime interview running, CTRL-C to end");

    let mut status = handle.status.clone();
    let mut printed = 0;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                for message in handle.transcript.snapshot().iter().skip(printed) {
                    println!("[{}] {}", message.role, message.content);
                    printed += 1;
                }
                if snapshot.end_reason.is_some() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; ending interview");
                break;
            }
        }
    }

    session.end();
    print_report(done_rx).await
}

async fn print_report(done_rx: oneshot::Receiver<CompletionReport>) -> anyhow::Result<()> {
    let report = done_rx.await.context("interview ended without a report")?;
    tracing::info!(reason = ?report.reason, turns = report.completed_turns, "Interview complete");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
