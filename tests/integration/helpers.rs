//! Scripted backends and event helpers shared by the integration tests.

use async_trait::async_trait;
use colloquy::audio::AudioSink;
use colloquy::config::{ChatConfig, RagConfig};
use colloquy::error::{ChatError, Outcome, Result};
use colloquy::llm::{
    ChatBackend, ChatMessage, GenerationOptions, GenerationStats, GenerationStream,
};
use colloquy::pipeline::messages::{SpeechSegment, SynthesizedAudio, Transcription};
use colloquy::rag::{Embedder, EmbeddingVector, HashingEmbedder, KnowledgeBase};
use colloquy::session::{HistoryStore, InMemoryHistory};
use colloquy::stt::Transcriber;
use colloquy::tts::{Speaker, Synthesizer};
use colloquy::{RuntimeEvent, SessionHandle, SessionOrchestrator};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// How a scripted generation ends after its tokens.
#[derive(Debug, Clone)]
pub(crate) enum Ending {
    End,
    /// Keep the stream open until cancelled.
    Hang,
    Fail(String),
}

/// Chat backend that replays fixed tokens.
pub(crate) struct ScriptedBackend {
    tokens: Vec<String>,
    delay: Duration,
    ending: Ending,
    pub(crate) calls: AtomicUsize,
    pub(crate) last_messages: Mutex<Vec<ChatMessage>>,
}

impl ScriptedBackend {
    pub(crate) fn new(tokens: &[&str], ending: Ending) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            delay: Duration::from_millis(5),
            ending,
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }
}

impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn start(&self, messages: Vec<ChatMessage>, _options: &GenerationOptions) -> GenerationStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages;

        let (sink, stream) = GenerationStream::channel();
        let tokens = self.tokens.clone();
        let delay = self.delay;
        let ending = self.ending.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            for token in &tokens {
                if !sink.token(token.clone()).await {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
            match ending {
                Ending::End => {
                    sink.end(GenerationStats {
                        tokens: tokens.len(),
                        elapsed: started.elapsed(),
                        ..Default::default()
                    })
                    .await;
                }
                Ending::Hang => sink.cancelled().await,
                Ending::Fail(message) => sink.fail(ChatError::Generation(message)).await,
            }
        });
        stream
    }
}

/// Transcriber that returns fixed text, or never returns.
pub(crate) struct ScriptedTranscriber {
    pub(crate) text: String,
    pub(crate) hang: bool,
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, segment: &SpeechSegment) -> Result<Transcription> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(Transcription {
            text: self.text.clone(),
            audio_captured_at: segment.started_at,
            transcribed_at: Instant::now(),
        })
    }
}

/// Synthesizer producing one sample per character.
pub(crate) struct CharSynth;

#[async_trait]
impl Synthesizer for CharSynth {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        Ok(SynthesizedAudio {
            samples: vec![0.0; text.chars().count()],
            sample_rate: 16_000,
        })
    }
}

/// Sink that "plays" each segment for `per_segment`, honouring cancel.
pub(crate) struct TimedSink {
    pub(crate) per_segment: Duration,
    pub(crate) played: AtomicUsize,
}

impl TimedSink {
    pub(crate) fn new(per_segment: Duration) -> Self {
        Self {
            per_segment,
            played: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AudioSink for TimedSink {
    async fn play(&self, _audio: SynthesizedAudio, cancel: &CancellationToken) -> Outcome<()> {
        tokio::select! {
            () = cancel.cancelled() => Outcome::Cancelled,
            () = tokio::time::sleep(self.per_segment) => {
                self.played.fetch_add(1, Ordering::SeqCst);
                Outcome::Completed(())
            }
        }
    }
}

/// Sink that never finishes a segment and ignores cancellation, so it keeps
/// the audio output after its turn is interrupted.
pub(crate) struct StubbornSink;

#[async_trait]
impl AudioSink for StubbornSink {
    async fn play(&self, _audio: SynthesizedAudio, _cancel: &CancellationToken) -> Outcome<()> {
        std::future::pending::<()>().await;
        Outcome::Completed(())
    }
}

/// Hashing embedder that can be told to stall, to hold a turn in Retrieving.
pub(crate) struct StallingEmbedder {
    inner: HashingEmbedder,
    pub(crate) stall: AtomicBool,
}

impl StallingEmbedder {
    pub(crate) fn new() -> Self {
        Self {
            inner: HashingEmbedder::new(256),
            stall: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Embedder for StallingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.embed_batch(texts).await
    }
}

pub(crate) fn rag_config() -> RagConfig {
    RagConfig {
        chunk_size: 100,
        overlap: 20,
        top_k: 3,
        token_budget: 400,
        ..Default::default()
    }
}

pub(crate) fn knowledge(embedder: Arc<dyn Embedder>) -> Arc<KnowledgeBase> {
    Arc::new(KnowledgeBase::new(rag_config(), embedder).unwrap())
}

pub(crate) fn empty_knowledge() -> Arc<KnowledgeBase> {
    knowledge(Arc::new(HashingEmbedder::new(256)))
}

/// Everything a session test needs to poke at afterwards.
pub(crate) struct TestSession {
    pub(crate) handle: SessionHandle,
    pub(crate) task: JoinHandle<()>,
    pub(crate) history: Arc<InMemoryHistory>,
    pub(crate) events: EventLog,
}

pub(crate) struct SessionParts {
    pub(crate) knowledge: Arc<KnowledgeBase>,
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) transcriber: Option<Arc<dyn Transcriber>>,
    pub(crate) sink: Option<Arc<dyn AudioSink>>,
    pub(crate) config: ChatConfig,
}

impl SessionParts {
    pub(crate) fn text(backend: Arc<dyn ChatBackend>) -> Self {
        let mut config = ChatConfig::default();
        config.rag = rag_config();
        config.session.release_timeout_ms = 500;
        config.barge_in.assistant_start_holdoff_ms = 0;
        Self {
            knowledge: empty_knowledge(),
            backend,
            transcriber: None,
            sink: None,
            config,
        }
    }

    pub(crate) fn start(self) -> TestSession {
        let config = self.config;
        let history = Arc::new(InMemoryHistory::new());
        let mut orchestrator = SessionOrchestrator::new(
            config,
            self.knowledge,
            self.backend,
            Arc::clone(&history) as Arc<dyn HistoryStore>,
        );
        if let Some(transcriber) = self.transcriber {
            orchestrator = orchestrator.with_transcriber(transcriber);
        }
        if let Some(sink) = self.sink {
            orchestrator = orchestrator.with_speaker(Speaker::new(Arc::new(CharSynth), sink));
        }
        let (handle, task) = orchestrator.start();
        let events = EventLog::new(handle.subscribe());
        TestSession {
            handle,
            task,
            history,
            events,
        }
    }
}

/// Records every event it reads so tests can assert on the whole run.
pub(crate) struct EventLog {
    rx: broadcast::Receiver<RuntimeEvent>,
    pub(crate) seen: Vec<RuntimeEvent>,
}

impl EventLog {
    pub(crate) fn new(rx: broadcast::Receiver<RuntimeEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Read until an event matches `pred` and return a copy of it.
    pub(crate) async fn until(&mut self, pred: impl Fn(&RuntimeEvent) -> bool) -> RuntimeEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.rx.recv().await.expect("event channel closed");
                self.seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Pick up whatever is already queued.
    pub(crate) fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
    }
}
