//! Orchestrator behaviour: full turns, interrupts and stage failures.

use crate::helpers::{
    Ending, ScriptedBackend, ScriptedTranscriber, SessionParts, StallingEmbedder, StubbornSink,
    TestSession, TimedSink, WAIT, knowledge,
};
use colloquy::config::{BargeInConfig, LlmConfig, VadConfig};
use colloquy::llm::{MessageRole, OllamaChat};
use colloquy::pipeline::VoiceCapture;
use colloquy::pipeline::messages::{AudioChunk, SpeechSegment, VoiceSignal};
use colloquy::rag::{Document, SourceType};
use colloquy::session::{HistoryStore, Role};
use colloquy::{Phase, RuntimeEvent, Stage};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Speech start loud enough to barge in under the default settings.
fn speech() -> VoiceSignal {
    VoiceSignal::SpeechStarted { rms: 0.5 }
}

fn segment() -> SpeechSegment {
    SpeechSegment {
        samples: vec![0.2; 16_000],
        sample_rate: 16_000,
        started_at: Instant::now(),
    }
}

fn entered(events: &[RuntimeEvent], phase: Phase) -> bool {
    events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::PhaseChanged { to, .. } if *to == phase))
}

async fn wait_idle_after(session: &TestSession, turn: u64) {
    tokio::time::timeout(
        WAIT,
        session
            .handle
            .wait_for(|s| s.turn >= turn && s.phase == Phase::Idle),
    )
    .await
    .expect("session never returned to idle")
    .unwrap();
}

async fn close(session: TestSession) {
    session.handle.close();
    tokio::time::timeout(WAIT, session.task)
        .await
        .expect("session did not shut down")
        .unwrap();
}

#[tokio::test]
async fn text_turn_completes_and_is_recorded() {
    let backend = Arc::new(ScriptedBackend::new(&["Hello", " there."], Ending::End));
    let mut session = SessionParts::text(backend.clone()).start();

    session.handle.submit_text("hi").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::TurnFinalized(t) if t.role == Role::Assistant))
        .await;
    wait_idle_after(&session, 1).await;

    let phases: Vec<Phase> = session
        .events
        .seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![Phase::Retrieving, Phase::Generating, Phase::Speaking, Phase::Idle]
    );

    let turns = session.history.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "hi");
    assert_eq!(turns[1].text, "Hello there.");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    close(session).await;
}

#[tokio::test]
async fn interrupt_mid_generation_discards_partial_reply() {
    let backend = Arc::new(ScriptedBackend::new(&["Partial", " answer"], Ending::Hang));
    let mut session = SessionParts::text(backend).start();

    session.handle.submit_text("tell me a story").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::Token { .. }))
        .await;
    assert_eq!(session.handle.snapshot().phase, Phase::Generating);

    session.handle.interrupt().unwrap();
    session
        .events
        .until(|e| {
            matches!(
                e,
                RuntimeEvent::WorkerFinished {
                    stage: Stage::Generation,
                    outcome: "cancelled",
                    ..
                }
            )
        })
        .await;
    wait_idle_after(&session, 1).await;
    session.events.drain();

    assert!(!entered(&session.events.seen, Phase::Speaking));
    assert!(session.events.seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::Cancelled {
            phase: Phase::Generating,
            ..
        }
    )));

    let turns = session.history.turns();
    assert_eq!(turns.len(), 1, "only the user's message is kept");
    assert_eq!(turns[0].role, Role::User);
    assert!(turns.iter().all(|t| !t.text.contains("Partial")));
    close(session).await;
}

#[tokio::test]
async fn interrupt_returns_to_idle_from_every_busy_phase() {
    // Listening: speech started, nothing else yet.
    {
        let backend = Arc::new(ScriptedBackend::new(&[], Ending::End));
        let mut session = SessionParts::text(backend).start();
        session.handle.voice(speech()).unwrap();
        session
            .events
            .until(|e| matches!(e, RuntimeEvent::PhaseChanged { to: Phase::Listening, .. }))
            .await;
        session.handle.interrupt().unwrap();
        session
            .events
            .until(|e| matches!(e, RuntimeEvent::Cancelled { phase: Phase::Listening, .. }))
            .await;
        assert_eq!(session.handle.snapshot().phase, Phase::Idle);
        close(session).await;
    }

    // Transcribing, Retrieving, Generating and Speaking each hold a worker
    // that must report `cancelled`.
    let cases: Vec<(Phase, Stage, SessionParts, bool)> = vec![
        (
            Phase::Transcribing,
            Stage::Transcription,
            SessionParts {
                transcriber: Some(Arc::new(ScriptedTranscriber {
                    text: String::new(),
                    hang: true,
                })),
                ..SessionParts::text(Arc::new(ScriptedBackend::new(&[], Ending::End)))
            },
            true,
        ),
        (
            Phase::Retrieving,
            Stage::Retrieval,
            stalled_retrieval().await,
            false,
        ),
        (
            Phase::Generating,
            Stage::Generation,
            SessionParts::text(Arc::new(ScriptedBackend::new(&["x"], Ending::Hang))),
            false,
        ),
        (
            Phase::Speaking,
            Stage::Playback,
            SessionParts {
                sink: Some(Arc::new(TimedSink::new(Duration::from_secs(60)))),
                ..SessionParts::text(Arc::new(ScriptedBackend::new(&["Long reply."], Ending::End)))
            },
            false,
        ),
    ];

    for (phase, stage, parts, by_voice) in cases {
        let mut session = parts.start();
        if by_voice {
            session.handle.voice(VoiceSignal::Utterance(segment())).unwrap();
        } else {
            session.handle.submit_text("question").unwrap();
        }
        session
            .events
            .until(|e| matches!(e, RuntimeEvent::PhaseChanged { to, .. } if *to == phase))
            .await;

        session.handle.interrupt().unwrap();
        session
            .events
            .until(|e| matches!(e, RuntimeEvent::Cancelled { phase: p, .. } if *p == phase))
            .await;
        assert_eq!(session.handle.snapshot().phase, Phase::Idle, "{phase}");
        session
            .events
            .until(|e| {
                matches!(
                    e,
                    RuntimeEvent::WorkerFinished { stage: s, outcome: "cancelled", .. } if *s == stage
                )
            })
            .await;
        close(session).await;
    }
}

async fn stalled_retrieval() -> SessionParts {
    let embedder = Arc::new(StallingEmbedder::new());
    let kb = knowledge(embedder.clone());
    kb.ingest(Document::new(
        "notes",
        "notes.txt",
        SourceType::PlainText,
        "Some notes that make the index non-empty.",
    ))
    .await
    .unwrap();
    embedder.stall.store(true, Ordering::SeqCst);
    SessionParts {
        knowledge: kb,
        ..SessionParts::text(Arc::new(ScriptedBackend::new(&[], Ending::End)))
    }
}

#[tokio::test]
async fn voice_turn_runs_every_stage() {
    let sink = Arc::new(TimedSink::new(Duration::from_millis(5)));
    let parts = SessionParts {
        transcriber: Some(Arc::new(ScriptedTranscriber {
            text: "what time is it".into(),
            hang: false,
        })),
        sink: Some(sink.clone()),
        ..SessionParts::text(Arc::new(ScriptedBackend::new(
            &["It is noon. ", "Enjoy lunch!"],
            Ending::End,
        )))
    };
    let mut session = parts.start();

    session.handle.voice(speech()).unwrap();
    session.handle.voice(VoiceSignal::Utterance(segment())).unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::TurnFinalized(t) if t.role == Role::Assistant))
        .await;
    wait_idle_after(&session, 1).await;

    for phase in [
        Phase::Listening,
        Phase::Transcribing,
        Phase::Retrieving,
        Phase::Generating,
        Phase::Speaking,
    ] {
        assert!(entered(&session.events.seen, phase), "never entered {phase}");
    }
    assert!(session.events.seen.iter().any(
        |e| matches!(e, RuntimeEvent::Transcript { text, .. } if text == "what time is it")
    ));
    assert_eq!(sink.played.load(Ordering::SeqCst), 2);
    assert_eq!(session.history.turns()[0].text, "what time is it");
    close(session).await;
}

#[tokio::test]
async fn retrieved_context_reaches_the_prompt() {
    let kb = knowledge(Arc::new(colloquy::rag::HashingEmbedder::new(256)));
    kb.ingest(Document::new(
        "ferry",
        "ferry.txt",
        SourceType::PlainText,
        "The harbor ferry departs every hour toward the northern islands.",
    ))
    .await
    .unwrap();
    let backend = Arc::new(ScriptedBackend::new(&["Hourly."], Ending::End));
    let mut session = SessionParts {
        knowledge: kb,
        ..SessionParts::text(backend.clone())
    }
    .start();

    session
        .handle
        .submit_text("how often does the harbor ferry leave")
        .unwrap();
    let citations = session
        .events
        .until(|e| matches!(e, RuntimeEvent::Citations { .. }))
        .await;
    match citations {
        RuntimeEvent::Citations { fragments, .. } => {
            assert_eq!(fragments[0].fragment.id.document_id, "ferry");
        }
        other => panic!("unexpected {other:?}"),
    }
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::TurnFinalized(t) if t.role == Role::Assistant))
        .await;

    let messages = backend.last_messages.lock().unwrap().clone();
    let user = messages.last().unwrap();
    assert_eq!(user.role, MessageRole::User);
    assert!(user.content.contains("[CONTEXT]"));
    assert!(user.content.contains("### Source: ferry.txt"));
    assert!(user.content.ends_with("how often does the harbor ferry leave"));

    let stored = session.history.turns();
    assert!(stored[0].context.is_some());
    assert_eq!(stored[0].citations.len(), 1);
    close(session).await;
}

#[tokio::test]
async fn generation_failure_aborts_turn_and_session_stays_usable() {
    let failing = Arc::new(ScriptedBackend::new(&["half"], Ending::Fail("boom".into())));
    let mut session = SessionParts::text(failing).start();

    session.handle.submit_text("first").unwrap();
    let error = session
        .events
        .until(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    match error {
        RuntimeEvent::Error {
            stage,
            message,
            backend_unreachable,
            ..
        } => {
            assert_eq!(stage, Stage::Generation);
            assert!(message.contains("boom"));
            assert!(!backend_unreachable);
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_idle_after(&session, 1).await;
    assert!(!entered(&session.events.seen, Phase::Speaking));

    // A new turn still starts after the failure.
    session.handle.submit_text("second").unwrap();
    wait_idle_after(&session, 2).await;
    assert_eq!(session.handle.snapshot().turn, 2);
    close(session).await;
}

#[tokio::test]
async fn unreachable_model_server_is_reported() {
    let backend = Arc::new(
        OllamaChat::new(&LlmConfig {
            api_url: "http://127.0.0.1:1".into(),
            connect_timeout_secs: 1,
            ..Default::default()
        })
        .unwrap(),
    );
    let mut session = SessionParts::text(backend).start();

    session.handle.submit_text("anyone there?").unwrap();
    let error = session
        .events
        .until(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    assert!(matches!(
        error,
        RuntimeEvent::Error {
            backend_unreachable: true,
            ..
        }
    ));
    wait_idle_after(&session, 1).await;
    close(session).await;
}

#[tokio::test]
async fn new_message_preempts_the_running_turn() {
    let backend = Arc::new(ScriptedBackend::new(&["slow"], Ending::Hang));
    let mut session = SessionParts::text(backend.clone()).start();

    session.handle.submit_text("one").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::Token { turn: 1, .. }))
        .await;

    session.handle.submit_text("two").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::Cancelled { turn: 1, .. }))
        .await;
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::Token { turn: 2, .. }))
        .await;

    assert_eq!(session.handle.snapshot().turn, 2);
    assert_eq!(session.handle.snapshot().phase, Phase::Generating);
    // No token of the first turn is reported after its cancellation.
    let cancelled_at = session
        .events
        .seen
        .iter()
        .position(|e| matches!(e, RuntimeEvent::Cancelled { turn: 1, .. }))
        .unwrap();
    assert!(
        session.events.seen[cancelled_at..]
            .iter()
            .all(|e| !matches!(e, RuntimeEvent::Token { turn: 1, .. }))
    );
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    close(session).await;
}

#[tokio::test]
async fn speech_barges_in_on_playback() {
    let parts = SessionParts {
        transcriber: Some(Arc::new(ScriptedTranscriber {
            text: "stop".into(),
            hang: false,
        })),
        sink: Some(Arc::new(TimedSink::new(Duration::from_secs(60)))),
        ..SessionParts::text(Arc::new(ScriptedBackend::new(
            &["A very long answer."],
            Ending::End,
        )))
    };
    let mut session = parts.start();

    session.handle.submit_text("explain everything").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { to: Phase::Speaking, .. }))
        .await;

    session.handle.voice(speech()).unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { turn: 2, to: Phase::Listening, .. }))
        .await;
    session.events.drain();
    assert!(session.events.seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::Cancelled {
            turn: 1,
            phase: Phase::Speaking
        }
    )));

    // Generation had finished, so the reply is kept even though playback
    // was cut short.
    let turns = session.history.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].text, "A very long answer.");
    close(session).await;
}

#[tokio::test]
async fn discarded_blip_returns_listening_to_idle() {
    let parts = SessionParts {
        transcriber: Some(Arc::new(ScriptedTranscriber {
            text: "hello".into(),
            hang: false,
        })),
        ..SessionParts::text(Arc::new(ScriptedBackend::new(&["Hi!"], Ending::End)))
    };
    let mut session = parts.start();

    // Real capture stage: 20ms chunks, starts confirmed after 40ms, anything
    // under 200ms of speech is dropped.
    let vad = VadConfig {
        threshold: 0.05,
        min_silence_duration_ms: 60,
        min_speech_duration_ms: 200,
    };
    let barge_in = BargeInConfig {
        confirm_ms: 40,
        ..Default::default()
    };
    let (audio_tx, audio_rx) = mpsc::channel(64);
    let (voice_tx, voice_rx) = mpsc::channel(8);
    let stage = VoiceCapture::new(&vad, &barge_in, 16_000)
        .with_playback_flag(session.handle.assistant_speaking());
    let capture = tokio::spawn(stage.run(audio_rx, voice_tx, CancellationToken::new()));
    let forward = session.handle.forward_voice(voice_rx);

    let chunk = |amplitude: f32| AudioChunk {
        samples: vec![amplitude; 320],
        sample_rate: 16_000,
        captured_at: Instant::now(),
    };
    for amplitude in [0.4, 0.4, 0.4, 0.0, 0.0, 0.0] {
        audio_tx.send(chunk(amplitude)).await.unwrap();
    }
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { turn: 1, to: Phase::Listening, .. }))
        .await;
    session
        .events
        .until(|e| {
            matches!(
                e,
                RuntimeEvent::PhaseChanged {
                    turn: 1,
                    from: Phase::Listening,
                    to: Phase::Idle
                }
            )
        })
        .await;
    assert!(!entered(&session.events.seen, Phase::Transcribing));
    assert!(session.history.turns().is_empty());

    // The next real utterance opens a fresh turn and runs to the end.
    for _ in 0..15 {
        audio_tx.send(chunk(0.4)).await.unwrap();
    }
    for _ in 0..3 {
        audio_tx.send(chunk(0.0)).await.unwrap();
    }
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::TurnFinalized(t) if t.role == Role::Assistant))
        .await;
    wait_idle_after(&session, 2).await;
    assert_eq!(session.history.turns()[0].text, "hello");

    drop(audio_tx);
    assert!(capture.await.unwrap().is_completed());
    forward.await.unwrap();
    close(session).await;
}

#[tokio::test]
async fn barge_in_that_fizzles_leaves_session_idle() {
    let backend = Arc::new(ScriptedBackend::new(&["Thinking"], Ending::Hang));
    let mut session = SessionParts::text(backend).start();

    session.handle.submit_text("ponder this").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::Token { turn: 1, .. }))
        .await;

    session.handle.voice(speech()).unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { turn: 2, to: Phase::Listening, .. }))
        .await;
    session.handle.voice(VoiceSignal::SpeechDiscarded).unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { turn: 2, to: Phase::Idle, .. }))
        .await;

    assert_eq!(session.handle.snapshot().phase, Phase::Idle);
    let turns = session.history.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].text, "ponder this");
    close(session).await;
}

#[tokio::test]
async fn weak_early_or_disabled_speech_does_not_barge_in() {
    let holdoff = {
        let mut parts = SessionParts {
            sink: Some(Arc::new(TimedSink::new(Duration::from_secs(60)))),
            ..SessionParts::text(Arc::new(ScriptedBackend::new(&["Reply."], Ending::End)))
        };
        parts.config.barge_in.assistant_start_holdoff_ms = 60_000;
        parts
    };
    let disabled = {
        let mut parts =
            SessionParts::text(Arc::new(ScriptedBackend::new(&["Thinking"], Ending::Hang)));
        parts.config.barge_in.enabled = false;
        parts
    };
    let cases: Vec<(&str, SessionParts, Phase, f32)> = vec![
        (
            "below min_rms",
            SessionParts::text(Arc::new(ScriptedBackend::new(&["Thinking"], Ending::Hang))),
            Phase::Generating,
            0.01,
        ),
        ("within holdoff", holdoff, Phase::Speaking, 0.5),
        ("disabled", disabled, Phase::Generating, 0.5),
    ];

    for (label, parts, phase, rms) in cases {
        let mut session = parts.start();
        session.handle.submit_text("go on").unwrap();
        session
            .events
            .until(|e| matches!(e, RuntimeEvent::PhaseChanged { to, .. } if *to == phase))
            .await;

        session.handle.voice(VoiceSignal::SpeechStarted { rms }).unwrap();
        session.handle.voice(VoiceSignal::Utterance(segment())).unwrap();
        session.handle.interrupt().unwrap();
        let cancelled = session
            .events
            .until(|e| matches!(e, RuntimeEvent::Cancelled { .. }))
            .await;
        assert!(
            matches!(cancelled, RuntimeEvent::Cancelled { turn: 1, phase: p } if p == phase),
            "{label}: {cancelled:?}"
        );
        assert!(!entered(&session.events.seen, Phase::Listening), "{label}");
        close(session).await;
    }
}

#[tokio::test]
async fn audio_output_held_past_release_timeout_fails_the_next_turn() {
    let mut session = SessionParts {
        sink: Some(Arc::new(StubbornSink)),
        ..SessionParts::text(Arc::new(ScriptedBackend::new(&["Reply."], Ending::End)))
    }
    .start();

    session.handle.submit_text("first").unwrap();
    session
        .events
        .until(|e| matches!(e, RuntimeEvent::PhaseChanged { turn: 1, to: Phase::Speaking, .. }))
        .await;
    let playing = session.handle.assistant_speaking();
    tokio::time::timeout(WAIT, async {
        while !playing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback never started");
    session.handle.interrupt().unwrap();
    wait_idle_after(&session, 1).await;

    // The first turn's playback never lets go of the device.
    session.handle.submit_text("second").unwrap();
    let error = session
        .events
        .until(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    match error {
        RuntimeEvent::Error {
            turn,
            stage,
            message,
            ..
        } => {
            assert_eq!(turn, 2);
            assert_eq!(stage, Stage::Playback);
            assert!(message.contains("busy"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    wait_idle_after(&session, 2).await;
    close(session).await;
}
