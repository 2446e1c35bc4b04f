//! Turn-taking scenarios against scripted adapters on a paused clock.

mod common;

use common::*;
use interview_voice::{
    EndReason, InterviewConfig, InterviewContext, InterviewOrchestrator, InterviewState,
    RecognitionError, SessionStatus, Speaker, SpeechCapabilities, VoiceError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const GREETING: &str = "Tell me about yourself";

fn config() -> InterviewConfig {
    InterviewConfig {
        greeting: Some(GREETING.to_string()),
        ..InterviewConfig::default()
    }
}

fn context() -> InterviewContext {
    InterviewContext::new()
        .candidate("Ada")
        .job_title("Backend Engineer")
        .company("Acme")
}

struct Rig {
    orchestrator: Arc<InterviewOrchestrator>,
    audio: Arc<MockAudio>,
    recognizer: Arc<MockRecognizer>,
    dialogue: Arc<MockDialogue>,
    timeline: Timeline,
    reports: Arc<std::sync::Mutex<Vec<interview_voice::CompletionReport>>>,
}

fn rig_with(
    config: InterviewConfig,
    audio: impl FnOnce(Timeline) -> MockAudio,
    steps: Vec<Step>,
    dialogue: MockDialogue,
) -> Rig {
    init_tracing();
    let timeline = timeline();
    let audio = Arc::new(audio(Arc::clone(&timeline)));
    let recognizer = Arc::new(MockRecognizer::new(Arc::clone(&timeline), steps));
    let dialogue = Arc::new(dialogue);
    let (reports, on_complete) = completion_log();
    let orchestrator = InterviewOrchestrator::new(
        config,
        audio.clone(),
        recognizer.clone(),
        dialogue.clone(),
    )
    .on_complete(on_complete);
    Rig {
        orchestrator: Arc::new(orchestrator),
        audio,
        recognizer,
        dialogue,
        timeline,
        reports,
    }
}

fn rig(steps: Vec<Step>, dialogue: MockDialogue) -> Rig {
    rig_with(config(), MockAudio::new, steps, dialogue)
}

async fn wait_status(rx: &mut watch::Receiver<SessionStatus>, check: impl FnMut(&SessionStatus) -> bool) {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(check))
        .await
        .expect("status not reached in time")
        .expect("status channel closed");
}

fn final_step(text: &str) -> Step {
    Step::Final(text.to_string())
}

#[tokio::test(start_paused = true)]
async fn greeting_answer_reply_then_listen_again() {
    let rig = rig(
        vec![final_step("I have five years of experience"), Step::Hang],
        MockDialogue::new([Ok("What interests you about this role?".to_string())]),
    );

    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    let transcript = handle.transcript.clone();
    wait_status(&mut status, |s| {
        s.state == InterviewState::ListeningForCandidate && transcript.len() == 3
    })
    .await;

    let requests = rig.dialogue.requests();
    assert_eq!(requests.len(), 1, "exactly one backend call");
    assert_eq!(requests[0].history.len(), 2);
    assert_eq!(requests[0].utterance, "I have five years of experience");
    assert_eq!(requests[0].context.job_title.as_deref(), Some("Backend Engineer"));

    let messages = transcript.snapshot();
    assert_eq!(messages[0].role, Speaker::Interviewer);
    assert_eq!(messages[0].content, GREETING);
    assert_eq!(messages[1].role, Speaker::Candidate);
    assert_eq!(messages[2].role, Speaker::Interviewer);
    assert_eq!(messages[2].content, "What interests you about this role?");
    assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    // capture is re-armed only once each utterance has finished playing
    let recognizer = Arc::clone(&rig.recognizer);
    eventually(|| recognizer.call_count() == 2).await;
    let timeline = rig.timeline.lock().unwrap().clone();
    assert_eq!(
        timeline,
        vec![
            format!("speak_start:{}", GREETING),
            format!("speak_end:{}", GREETING),
            "listen".to_string(),
            "speak_start:What interests you about this role?".to_string(),
            "speak_end:What interests you about this role?".to_string(),
            "listen".to_string(),
        ]
    );
    assert!(status.borrow().capturing);
    assert!(!status.borrow().interviewer_speaking);
}

#[tokio::test(start_paused = true)]
async fn finals_are_discarded_while_processing_or_speaking() {
    let rig = rig(
        vec![final_step("First answer"), Step::Hang],
        MockDialogue::new([Ok("Second question?".to_string())]).delay(Duration::from_secs(2)),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();

    wait_status(&mut status, |s| s.state == InterviewState::ProcessingResponse).await;
    assert!(!rig.orchestrator.on_final_utterance("Spurious echo"));
    assert_eq!(handle.transcript.len(), 2);

    wait_status(&mut status, |s| s.state == InterviewState::Speaking).await;
    assert!(status.borrow().interviewer_speaking);
    assert!(!rig.orchestrator.on_final_utterance("Talking over the interviewer"));
    assert_eq!(handle.transcript.len(), 3);

    wait_status(&mut status, |s| s.state == InterviewState::ListeningForCandidate).await;
    assert!(rig.orchestrator.on_final_utterance("A real answer"));
    assert_eq!(handle.transcript.len(), 4);
    let dialogue = Arc::clone(&rig.dialogue);
    eventually(|| dialogue.requests().len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn only_the_first_final_of_a_window_is_processed() {
    let rig = rig(
        vec![
            Step::Finals(vec!["first".to_string(), "second".to_string()]),
            Step::Hang,
        ],
        MockDialogue::new([]).delay(Duration::from_secs(60)),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::ProcessingResponse).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let contents: Vec<String> = handle.transcript.snapshot().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec![GREETING.to_string(), "first".to_string()]);
    let requests = rig.dialogue.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].utterance, "first");
    assert_eq!(rig.orchestrator.state(), InterviewState::ProcessingResponse);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_500_1000_2000() {
    let transient = || Step::Fail(RecognitionError::TransientFailure("network".into()));
    let rig = rig(
        vec![transient(), transient(), transient(), Step::Hang],
        MockDialogue::new([]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();

    let recognizer = Arc::clone(&rig.recognizer);
    eventually(|| recognizer.call_count() == 4).await;

    let calls = rig.recognizer.calls();
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([500u64, 1000, 2000]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(20),
            "gap {:?}, expected {:?}",
            gap,
            expected
        );
    }

    let status = handle.status.borrow().clone();
    assert_eq!(status.state, InterviewState::ListeningForCandidate);
    assert!(!status.connection_unstable);
    assert_eq!(handle.transcript.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn end_while_backing_off_never_restarts_capture() {
    let rig = rig(
        vec![Step::Fail(RecognitionError::TransientFailure("503".into()))],
        MockDialogue::new([]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::Reconnecting).await;

    rig.orchestrator.end();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.recognizer.call_count(), 1);
    assert_eq!(rig.orchestrator.state(), InterviewState::Ended);
    assert!(!status.borrow().capturing);
}

#[tokio::test(start_paused = true)]
async fn persistent_failures_raise_unstable_notice_without_ending() {
    let transient = || Step::Fail(RecognitionError::TransientFailure("503".into()));
    let mut steps: Vec<Step> = (0..5).map(|_| transient()).collect();
    steps.push(final_step("Sorry, I'm back"));
    let rig = rig(steps, MockDialogue::new([]).delay(Duration::from_secs(60)));
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();

    wait_status(&mut status, |s| s.connection_unstable).await;
    assert_ne!(status.borrow().state, InterviewState::Ended);

    // the next successful recognition clears the notice
    wait_status(&mut status, |s| s.state == InterviewState::ProcessingResponse).await;
    assert!(!status.borrow().connection_unstable);
}

#[tokio::test(start_paused = true)]
async fn silent_windows_restart_without_escalation() {
    let rig = rig(
        vec![
            Step::Fail(RecognitionError::NoSpeechDetected),
            Step::Fail(RecognitionError::NoSpeechDetected),
            Step::Fail(RecognitionError::NoSpeechDetected),
            Step::Hang,
        ],
        MockDialogue::new([]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let recognizer = Arc::clone(&rig.recognizer);
    eventually(|| recognizer.call_count() == 4).await;

    let calls = rig.recognizer.calls();
    for w in calls.windows(2) {
        let gap = w[1] - w[0];
        assert!(gap >= Duration::from_millis(500) && gap < Duration::from_millis(520));
    }
    assert!(!handle.status.borrow().connection_unstable);
    assert!(handle.status.borrow().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn permission_revoked_ends_without_backoff() {
    let rig = rig(
        vec![Step::Fail(RecognitionError::PermissionRevoked)],
        MockDialogue::new([]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::Ended).await;

    assert_eq!(status.borrow().end_reason, Some(EndReason::PermissionRevoked));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.recognizer.call_count(), 1, "no restart after revocation");
    assert_eq!(rig.audio.releases.load(Ordering::SeqCst), 1);

    let reports = rig.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, EndReason::PermissionRevoked);
    assert_eq!(reports[0].session_id, handle.session_id);
}

#[tokio::test(start_paused = true)]
async fn lost_microphone_ends_without_restart() {
    let rig = rig(
        vec![
            final_step("Hello"),
            Step::Fail(RecognitionError::DeviceUnavailable("unplugged".into())),
        ],
        MockDialogue::new([Ok("Go on.".to_string())]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::Ended).await;

    assert_eq!(status.borrow().end_reason, Some(EndReason::DeviceUnavailable));
    assert!(status.borrow().last_error.as_deref().unwrap().contains("unplugged"));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.recognizer.call_count(), 2, "no restart after the device is gone");
    assert_eq!(rig.audio.releases.load(Ordering::SeqCst), 1);

    let reports = rig.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, EndReason::DeviceUnavailable);
    assert_eq!(reports[0].transcript.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn end_is_idempotent_and_freezes_the_log() {
    let rig = rig(vec![Step::Hang], MockDialogue::new([]));
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::ListeningForCandidate).await;

    rig.orchestrator.end();
    assert_eq!(rig.orchestrator.state(), InterviewState::Ended);
    status.borrow_and_update();

    rig.orchestrator.end();
    assert!(!status.has_changed().unwrap(), "second end() published nothing");
    assert_eq!(rig.audio.releases.load(Ordering::SeqCst), 1);
    assert_eq!(rig.audio.stops.load(Ordering::SeqCst), 1);
    assert_eq!(rig.reports.lock().unwrap().len(), 1);
    assert_eq!(rig.reports.lock().unwrap()[0].reason, EndReason::Requested);

    // a late fragment does not touch the log
    assert!(!rig.orchestrator.on_final_utterance("Wait, one more thing"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.transcript.len(), 1);
    assert_eq!(rig.recognizer.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn end_while_speaking_stops_playback() {
    let rig = rig(vec![Step::Hang], MockDialogue::new([]));
    let handle = rig.orchestrator.start(context()).await.unwrap();
    assert_eq!(rig.orchestrator.state(), InterviewState::Greeting);
    assert!(handle.status.borrow().interviewer_speaking);

    rig.orchestrator.end();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.orchestrator.state(), InterviewState::Ended);
    assert_eq!(rig.recognizer.call_count(), 0, "capture never armed after end()");
    assert_eq!(rig.audio.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn end_during_permission_request_cancels_start() {
    let rig = rig_with(
        config(),
        |t| MockAudio::new(t).hang_on_acquire(),
        vec![],
        MockDialogue::new([]),
    );
    let orchestrator = Arc::clone(&rig.orchestrator);
    let starting = tokio::spawn(async move { orchestrator.start(context()).await });

    let audio = Arc::clone(&rig.audio);
    eventually(|| audio.acquires.load(Ordering::SeqCst) == 1).await;
    rig.orchestrator.end();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(VoiceError::SessionEnded)));
    assert_eq!(rig.orchestrator.state(), InterviewState::Ended);
    assert_eq!(rig.reports.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_microphone_is_terminal() {
    let rig = rig_with(
        config(),
        |t| MockAudio::new(t).deny_microphone(VoiceError::PermissionDenied("user said no".into())),
        vec![],
        MockDialogue::new([]),
    );
    let result = rig.orchestrator.start(context()).await;
    assert!(matches!(result, Err(VoiceError::PermissionDenied(_))));
    assert_eq!(rig.orchestrator.state(), InterviewState::Ended);
    assert_eq!(rig.orchestrator.status().end_reason, Some(EndReason::PermissionDenied));
    assert_eq!(rig.recognizer.call_count(), 0);
    assert!(rig.dialogue.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_synthesis_is_rejected_before_anything_starts() {
    let rig = rig_with(
        config(),
        |t| {
            MockAudio::new(t).capabilities(SpeechCapabilities {
                recognition: true,
                synthesis: false,
            })
        },
        vec![],
        MockDialogue::new([]),
    );
    let result = rig.orchestrator.start(context()).await;
    assert!(matches!(result, Err(VoiceError::CapabilityMissing(_))));
    assert_eq!(rig.orchestrator.state(), InterviewState::Idle);
    assert_eq!(rig.audio.acquires.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn one_session_at_a_time() {
    let rig = rig(vec![Step::Hang, Step::Hang], MockDialogue::new([]));
    let first = rig.orchestrator.start(context()).await.unwrap();
    assert!(matches!(
        rig.orchestrator.start(context()).await,
        Err(VoiceError::SessionActive)
    ));

    rig.orchestrator.end();
    let second = rig.orchestrator.start(context()).await.unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.transcript.len(), 1);
    assert_eq!(first.transcript.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn turn_limit_speaks_closing_line_then_ends() {
    let config = InterviewConfig {
        max_turns: 2,
        ..config()
    };
    let rig = rig_with(
        config.clone(),
        MockAudio::new,
        vec![final_step("Answer one"), final_step("Answer two"), Step::Hang],
        MockDialogue::new([Ok("Question two?".to_string())]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::Ended).await;

    let messages = handle.transcript.snapshot();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![GREETING, "Answer one", "Question two?", "Answer two", config.closing_line.as_str()]
    );
    assert_eq!(rig.dialogue.requests().len(), 1);

    let reports = rig.reports.lock().unwrap();
    assert_eq!(reports[0].reason, EndReason::MaxTurnsReached);
    assert_eq!(reports[0].completed_turns, 2);
    assert_eq!(reports[0].transcript.len(), 5);
    assert_eq!(rig.recognizer.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn backend_failure_abandons_turn_and_resumes_capture() {
    let rig = rig(
        vec![final_step("First answer"), final_step("Second try"), Step::Hang],
        MockDialogue::new([
            Err(VoiceError::Dialogue("upstream 500".into())),
            Ok("Thanks, next question?".to_string()),
        ]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    let transcript = handle.transcript.clone();
    wait_status(&mut status, |s| {
        s.state == InterviewState::ListeningForCandidate && transcript.len() == 4
    })
    .await;

    let contents: Vec<String> = transcript.snapshot().into_iter().map(|m| m.content).collect();
    assert_eq!(
        contents,
        vec![GREETING, "First answer", "Second try", "Thanks, next question?"]
    );
    assert!(status.borrow().last_error.as_deref().unwrap().contains("upstream 500"));

    let requests = rig.dialogue.requests();
    assert_eq!(requests.len(), 2, "no automatic retry");
    assert_eq!(requests[1].history.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn opening_comes_from_backend_without_static_greeting() {
    let config = InterviewConfig {
        greeting: None,
        ..InterviewConfig::default()
    };
    let rig = rig_with(
        config,
        MockAudio::new,
        vec![Step::Hang],
        MockDialogue::new([Ok("Welcome Ada! Tell me about your background.".to_string())]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::ListeningForCandidate).await;

    let requests = rig.dialogue.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].history.is_empty());
    assert!(requests[0].utterance.is_empty());
    assert_eq!(
        handle.transcript.last().unwrap().content,
        "Welcome Ada! Tell me about your background."
    );
}

#[tokio::test(start_paused = true)]
async fn failed_opening_falls_back_to_built_in_question() {
    let config = InterviewConfig {
        greeting: None,
        ..InterviewConfig::default()
    };
    let rig = rig_with(
        config.clone(),
        MockAudio::new,
        vec![Step::Hang],
        MockDialogue::new([Err(VoiceError::RateLimited("slow down".into()))]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.state == InterviewState::ListeningForCandidate).await;

    assert_eq!(handle.transcript.len(), 1);
    assert_eq!(handle.transcript.snapshot()[0].content, config.opening_line);
    assert!(status.borrow().last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn empty_reply_uses_fallback() {
    let config = config();
    let rig = rig_with(
        config.clone(),
        MockAudio::new,
        vec![final_step("Hello"), Step::Hang],
        MockDialogue::new([Ok("   ".to_string())]),
    );
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let transcript = handle.transcript.clone();
    eventually(|| transcript.len() == 3).await;
    assert_eq!(transcript.snapshot()[2].content, config.fallback_reply);
}

#[tokio::test(start_paused = true)]
async fn interim_text_is_status_only() {
    let rig = rig(vec![Step::Interim("I have five".into())], MockDialogue::new([]));
    let handle = rig.orchestrator.start(context()).await.unwrap();
    let mut status = handle.status.clone();
    wait_status(&mut status, |s| s.interim.is_some()).await;

    assert_eq!(status.borrow().interim.as_deref(), Some("I have five"));
    assert_eq!(handle.transcript.len(), 1);
}
