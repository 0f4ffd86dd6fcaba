//! Session orchestrator: owns the state machine and sequences the stage
//! workers of each turn.
//!
//! A single task applies every transition. Workers (transcription,
//! retrieval, generation, playback) run as their own tasks, observe the
//! turn's cancellation token and report back tagged with the turn number;
//! reports for a turn that is no longer current are dropped.

use crate::config::{BargeInConfig, ChatConfig, LlmConfig};
use crate::error::{ChatError, Outcome, Result};
use crate::llm::{ChatBackend, GenerationOptions, GenerationStats, StreamEvent, build_messages};
use crate::pipeline::messages::{SpeechSegment, Transcription, VoiceSignal};
use crate::rag::{AssembledContext, KnowledgeBase};
use crate::runtime::{RuntimeEvent, Stage};
use crate::session::{
    ConversationTurn, HistoryStore, Phase, Role, SessionSnapshot, SessionState, Trigger,
};
use crate::stt::Transcriber;
use crate::tts::Speaker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands accepted by a running session.
#[derive(Debug)]
enum Command {
    SubmitText(String),
    Voice(VoiceSignal),
    Interrupt,
    Close,
}

/// Worker results sent back to the orchestrator.
#[derive(Debug)]
enum Report {
    Transcribed(Outcome<Transcription>),
    Retrieved(Outcome<AssembledContext>),
    Token(String),
    Generated(Outcome<(String, GenerationStats)>),
    Spoken(Outcome<usize>),
}

impl Report {
    /// Stage and outcome label for terminal reports.
    fn summary(&self) -> Option<(Stage, &'static str)> {
        match self {
            Self::Transcribed(o) => Some((Stage::Transcription, o.label())),
            Self::Retrieved(o) => Some((Stage::Retrieval, o.label())),
            Self::Token(_) => None,
            Self::Generated(o) => Some((Stage::Generation, o.label())),
            Self::Spoken(o) => Some((Stage::Playback, o.label())),
        }
    }
}

#[derive(Debug)]
struct StageReport {
    turn: u64,
    report: Report,
}

/// What the current turn has produced so far.
#[derive(Debug, Default)]
struct TurnRecord {
    user_text: Option<String>,
    context: AssembledContext,
    assistant_text: Option<String>,
}

/// Exclusive ownership of a device or model connection.
///
/// A cancelled worker normally drops its guard promptly. If it still holds
/// the lease after `timeout`, the next worker fails with
/// [`ChatError::DeviceBusy`] rather than sharing the device.
#[derive(Debug, Clone)]
struct Lease {
    name: &'static str,
    lock: Arc<Mutex<()>>,
    timeout: Duration,
}

impl Lease {
    fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            lock: Arc::new(Mutex::new(())),
            timeout,
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Outcome<OwnedMutexGuard<()>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::Cancelled,
            guard = tokio::time::timeout(self.timeout, Arc::clone(&self.lock).lock_owned()) => {
                match guard {
                    Ok(guard) => Outcome::Completed(guard),
                    Err(_) => {
                        warn!("{} still held after {}ms", self.name, self.timeout.as_millis());
                        Outcome::Failed(ChatError::DeviceBusy(format!(
                            "{} not released within {}ms",
                            self.name,
                            self.timeout.as_millis()
                        )))
                    }
                }
            }
        }
    }
}

/// Raises the shared playback flag for as long as it is alive.
struct PlaybackFlag(Arc<AtomicBool>);

impl PlaybackFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(Arc::clone(flag))
    }
}

impl Drop for PlaybackFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Whether we're still within the holdoff window after playback started.
fn within_holdoff(since: Option<Instant>, holdoff_ms: u32) -> bool {
    if holdoff_ms == 0 {
        return false;
    }
    since.is_some_and(|t| t.elapsed() < Duration::from_millis(u64::from(holdoff_ms)))
}

/// Builder for one conversation session.
pub struct SessionOrchestrator {
    config: ChatConfig,
    knowledge: Arc<KnowledgeBase>,
    backend: Arc<dyn ChatBackend>,
    history: Arc<dyn HistoryStore>,
    transcriber: Option<Arc<dyn Transcriber>>,
    speaker: Option<Speaker>,
}

impl SessionOrchestrator {
    pub fn new(
        config: ChatConfig,
        knowledge: Arc<KnowledgeBase>,
        backend: Arc<dyn ChatBackend>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            config,
            knowledge,
            backend,
            history,
            transcriber: None,
            speaker: None,
        }
    }

    /// Enable voice turns.
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    /// Speak replies. Without a speaker the Speaking phase completes at once.
    pub fn with_speaker(mut self, speaker: Speaker) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Spawn the session task. Must be called from within a tokio runtime.
    ///
    /// The task ends after [`SessionHandle::close`] or once every handle
    /// is dropped; an in-flight turn is interrupted first.
    pub fn start(self) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(self.config.session.event_capacity.max(1));
        let state = SessionState::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let release_timeout = Duration::from_millis(self.config.session.release_timeout_ms);
        let assistant_speaking = Arc::new(AtomicBool::new(false));

        let task = SessionTask {
            llm: self.config.llm,
            barge_in: self.config.barge_in,
            speaking_since: None,
            assistant_speaking: Arc::clone(&assistant_speaking),
            knowledge: self.knowledge,
            backend: self.backend,
            history: self.history,
            transcriber: self.transcriber,
            speaker: self.speaker,
            state,
            cancel: CancellationToken::new(),
            record: TurnRecord::default(),
            commands: command_rx,
            reports: report_rx,
            report_tx,
            events: event_tx.clone(),
            snapshot: snapshot_tx,
            model_lease: Lease::new("model connection", release_timeout),
            audio_lease: Lease::new("audio output", release_timeout),
        };
        let join = tokio::spawn(task.run());

        let handle = SessionHandle {
            commands: command_tx,
            events: event_tx,
            snapshot: snapshot_rx,
            assistant_speaking,
        };
        (handle, join)
    }
}

/// Client side of a running session: commands in, notifications out.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RuntimeEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    assistant_speaking: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Send typed input. Interrupts a turn in progress.
    ///
    /// # Errors
    ///
    /// [`ChatError::Channel`] if the session has closed.
    pub fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SubmitText(text.into()))
    }

    /// Deliver a voice capture signal.
    ///
    /// # Errors
    ///
    /// [`ChatError::Channel`] if the session has closed.
    pub fn voice(&self, signal: VoiceSignal) -> Result<()> {
        self.send(Command::Voice(signal))
    }

    /// Stop whatever the session is doing and return to Idle.
    ///
    /// # Errors
    ///
    /// [`ChatError::Channel`] if the session has closed.
    pub fn interrupt(&self) -> Result<()> {
        self.send(Command::Interrupt)
    }

    /// Close the session. Closing twice is not an error.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Subscribe to runtime events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Current session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshot.borrow()
    }

    /// Flag that is true while the assistant's reply is playing. Hand it to
    /// [`crate::pipeline::VoiceCapture::with_playback_flag`] for echo
    /// suppression.
    pub fn assistant_speaking(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.assistant_speaking)
    }

    /// Wait until the session state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Channel`] if the session closes first.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| ChatError::Channel("session closed".into()))?;
        Ok(*snapshot)
    }

    /// Forward signals from a voice capture stage until it stops.
    pub fn forward_voice(&self, mut rx: mpsc::Receiver<VoiceSignal>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if handle.voice(signal).is_err() {
                    break;
                }
            }
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::Channel("session closed".into()))
    }
}

/// The running session. Only this task touches [`SessionState`].
struct SessionTask {
    llm: LlmConfig,
    barge_in: BargeInConfig,
    /// When the current turn entered Speaking.
    speaking_since: Option<Instant>,
    assistant_speaking: Arc<AtomicBool>,
    knowledge: Arc<KnowledgeBase>,
    backend: Arc<dyn ChatBackend>,
    history: Arc<dyn HistoryStore>,
    transcriber: Option<Arc<dyn Transcriber>>,
    speaker: Option<Speaker>,
    state: SessionState,
    /// Cancellation token of the current turn.
    cancel: CancellationToken,
    record: TurnRecord,
    commands: mpsc::UnboundedReceiver<Command>,
    reports: mpsc::UnboundedReceiver<StageReport>,
    report_tx: mpsc::UnboundedSender<StageReport>,
    events: broadcast::Sender<RuntimeEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    model_lease: Lease,
    audio_lease: Lease,
}

impl SessionTask {
    async fn run(mut self) {
        info!(
            "session started (backend: {}, model: {})",
            self.backend.name(),
            self.backend.model()
        );
        loop {
            // Commands first: an interrupt beats any pending stage report.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(report) = self.reports.recv() => self.on_report(report),
            }
        }
        self.interrupt();
        info!("session closed after {} turns", self.state.turn());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SubmitText(text) => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    debug!("ignoring empty submission");
                    return;
                }
                self.interrupt();
                let turn = self.begin_turn(Trigger::TextSubmitted);
                self.record.user_text = Some(text.clone());
                self.spawn_retrieval(turn, text);
            }
            Command::Voice(VoiceSignal::SpeechStarted { rms }) => match self.state.phase() {
                Phase::Idle => {
                    self.begin_turn(Trigger::VoiceActivity);
                }
                Phase::Listening => {}
                phase => match self.barge_in_blocked(phase, rms) {
                    Some(reason) => debug!(%phase, rms, "speech ignored: {reason}"),
                    None => {
                        info!(rms, "barge-in: user started speaking");
                        self.interrupt();
                        self.begin_turn(Trigger::VoiceActivity);
                    }
                },
            },
            Command::Voice(VoiceSignal::SpeechDiscarded) => {
                if self.state.phase() == Phase::Listening {
                    let turn = self.state.turn();
                    info!(turn, "speech too short, back to idle");
                    self.advance(turn, Trigger::VoiceDiscarded);
                    self.finalize(turn);
                } else {
                    debug!(phase = %self.state.phase(), "discarded speech outside listening");
                }
            }
            Command::Voice(VoiceSignal::Utterance(segment)) => {
                match self.state.phase() {
                    Phase::Listening => {}
                    Phase::Idle => {
                        self.begin_turn(Trigger::VoiceActivity);
                    }
                    phase => {
                        // Only a barge-in (a SpeechStarted) may take over a busy turn.
                        debug!(%phase, "utterance ignored while busy");
                        return;
                    }
                }
                let turn = self.state.turn();
                if self.advance(turn, Trigger::UtteranceFinalized) {
                    self.spawn_transcription(turn, segment);
                }
            }
            Command::Interrupt => {
                if !self.interrupt() {
                    debug!("interrupt while idle ignored");
                }
            }
            Command::Close => {}
        }
    }

    fn on_report(&mut self, StageReport { turn, report }: StageReport) {
        if let Some((stage, outcome)) = report.summary() {
            self.emit(RuntimeEvent::WorkerFinished {
                turn,
                stage,
                outcome,
            });
        }
        if turn != self.state.turn() || self.state.phase().is_idle() {
            debug!(turn, "dropping report from finished turn");
            return;
        }

        match report {
            Report::Transcribed(Outcome::Completed(transcription)) => {
                if transcription.text.is_empty() {
                    info!("empty transcript, nothing to answer");
                    self.advance(turn, Trigger::TranscriptionFailed);
                    self.finalize(turn);
                    return;
                }
                let latency = transcription
                    .transcribed_at
                    .saturating_duration_since(transcription.audio_captured_at);
                info!(
                    "transcribed in {:.2}s: {}",
                    latency.as_secs_f32(),
                    transcription.text
                );
                self.emit(RuntimeEvent::Transcript {
                    turn,
                    text: transcription.text.clone(),
                });
                self.record.user_text = Some(transcription.text.clone());
                if self.advance(turn, Trigger::TranscriptReady) {
                    self.spawn_retrieval(turn, transcription.text);
                }
            }
            Report::Transcribed(Outcome::Failed(e)) => {
                self.fail(turn, Stage::Transcription, Trigger::TranscriptionFailed, e);
            }
            Report::Retrieved(Outcome::Completed(context)) => {
                if !context.is_empty() {
                    self.emit(RuntimeEvent::Citations {
                        turn,
                        fragments: context.fragments.clone(),
                    });
                }
                self.record.context = context;
                if self.advance(turn, Trigger::ContextAssembled) {
                    self.spawn_generation(turn);
                }
            }
            Report::Retrieved(Outcome::Failed(e)) => {
                self.fail(turn, Stage::Retrieval, Trigger::RetrievalFailed, e);
            }
            Report::Token(text) => {
                if self.state.phase() == Phase::Generating {
                    self.emit(RuntimeEvent::Token { turn, text });
                }
            }
            Report::Generated(Outcome::Completed((text, stats))) => {
                info!(
                    "generated {} tokens at {:.1} tok/s",
                    stats.tokens,
                    stats.tokens_per_second()
                );
                self.emit(RuntimeEvent::GenerationFinished { turn, stats });
                self.record.assistant_text = Some(text.clone());
                if self.advance(turn, Trigger::StreamEnded) {
                    self.speaking_since = Some(Instant::now());
                    self.spawn_speech(turn, text);
                }
            }
            Report::Generated(Outcome::Failed(e)) => {
                self.fail(turn, Stage::Generation, Trigger::StreamFailed, e);
            }
            Report::Spoken(Outcome::Completed(segments)) => {
                debug!(segments, "playback finished");
                self.advance(turn, Trigger::PlaybackFinished);
                self.finalize(turn);
            }
            Report::Spoken(Outcome::Failed(e)) => {
                self.fail(turn, Stage::Playback, Trigger::SynthesisFailed, e);
            }
            Report::Transcribed(Outcome::Cancelled)
            | Report::Retrieved(Outcome::Cancelled)
            | Report::Generated(Outcome::Cancelled)
            | Report::Spoken(Outcome::Cancelled) => {
                // Only an interrupt cancels a turn, and that already moved us to Idle.
                warn!(turn, "worker cancelled without an interrupt");
            }
        }
    }

    /// Why speech in `phase` may not interrupt the turn, if it may not.
    fn barge_in_blocked(&self, phase: Phase, rms: f32) -> Option<&'static str> {
        if !self.barge_in.enabled {
            Some("barge-in disabled")
        } else if rms < self.barge_in.min_rms {
            Some("below barge-in energy")
        } else if phase == Phase::Speaking
            && within_holdoff(self.speaking_since, self.barge_in.assistant_start_holdoff_ms)
        {
            Some("within playback holdoff")
        } else {
            None
        }
    }

    fn begin_turn(&mut self, trigger: Trigger) -> u64 {
        let (turn, cancel) = self.state.begin_turn();
        self.cancel = cancel;
        self.record = TurnRecord::default();
        self.advance(turn, trigger);
        turn
    }

    /// Apply `trigger`, publishing the change. Returns whether it applied.
    fn advance(&mut self, turn: u64, trigger: Trigger) -> bool {
        let from = self.state.phase();
        match self.state.apply(trigger) {
            Some(to) => {
                debug!(turn, "{from} -> {to}");
                self.publish();
                self.emit(RuntimeEvent::PhaseChanged { turn, from, to });
                true
            }
            None => {
                warn!(turn, ?trigger, "trigger does not apply in {from}");
                false
            }
        }
    }

    /// Cancel the current turn and return to Idle. Returns false if idle.
    fn interrupt(&mut self) -> bool {
        let turn = self.state.turn();
        let Some(from) = self.state.interrupt() else {
            return false;
        };
        info!(turn, "turn interrupted while {from}");
        self.publish();
        self.emit(RuntimeEvent::Cancelled { turn, phase: from });
        self.emit(RuntimeEvent::PhaseChanged {
            turn,
            from,
            to: Phase::Idle,
        });
        self.finalize(turn);
        true
    }

    fn fail(&mut self, turn: u64, stage: Stage, trigger: Trigger, e: ChatError) {
        error!(turn, "{stage} failed: {e}");
        self.emit(RuntimeEvent::Error {
            turn,
            stage,
            message: e.to_string(),
            backend_unreachable: e.is_backend_unreachable(),
        });
        if !self.advance(turn, trigger) {
            // Never leave a failed turn in a busy phase.
            self.state.interrupt();
            self.publish();
        }
        self.finalize(turn);
    }

    /// Hand what the turn produced to the history store.
    ///
    /// The assistant turn is stored only if generation completed, so an
    /// interrupted stream never leaves partial text in history.
    fn finalize(&mut self, turn: u64) {
        let record = std::mem::take(&mut self.record);
        let Some(user_text) = record.user_text else {
            return;
        };
        let citations: Vec<_> = record
            .context
            .fragments
            .iter()
            .map(|f| f.fragment.id.clone())
            .collect();
        let context = (!record.context.is_empty()).then_some(record.context.block);

        let mut turns =
            vec![ConversationTurn::new(turn, Role::User, user_text, context)
                .with_citations(citations.clone())];
        if let Some(text) = record.assistant_text {
            turns.push(
                ConversationTurn::new(turn, Role::Assistant, text, None).with_citations(citations),
            );
        }
        for entry in turns {
            if let Err(e) = self.history.append(entry.clone()) {
                error!(turn, "failed to store conversation turn: {e}");
                continue;
            }
            self.emit(RuntimeEvent::TurnFinalized(entry));
        }
    }

    fn spawn_transcription(&self, turn: u64, segment: SpeechSegment) {
        let tx = self.report_tx.clone();
        let cancel = self.cancel.clone();
        let Some(transcriber) = self.transcriber.clone() else {
            let err = ChatError::InvalidConfiguration("no transcriber configured".into());
            let _ = tx.send(StageReport {
                turn,
                report: Report::Transcribed(Outcome::Failed(err)),
            });
            return;
        };
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => Outcome::Cancelled,
                result = transcriber.transcribe(&segment) => result.into(),
            };
            let _ = tx.send(StageReport {
                turn,
                report: Report::Transcribed(outcome),
            });
        });
    }

    fn spawn_retrieval(&self, turn: u64, query: String) {
        let tx = self.report_tx.clone();
        let cancel = self.cancel.clone();
        let assembler = self.knowledge.assembler();
        let budget = self.knowledge.token_budget();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => Outcome::Cancelled,
                result = assembler.assemble(&query, budget) => result.into(),
            };
            let _ = tx.send(StageReport {
                turn,
                report: Report::Retrieved(outcome),
            });
        });
    }

    fn spawn_generation(&self, turn: u64) {
        let user_text = self.record.user_text.clone().unwrap_or_default();
        let messages = build_messages(
            &self.llm,
            &self.history.turns(),
            &self.record.context.block,
            &user_text,
        );
        let options = GenerationOptions::from_config(&self.llm);
        let backend = Arc::clone(&self.backend);
        let lease = self.model_lease.clone();
        let tx = self.report_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = match lease.acquire(&cancel).await {
                Outcome::Completed(guard) => {
                    let stream = backend.start(messages, &options);
                    let outcome = consume_stream(stream, turn, &tx, &cancel).await;
                    drop(guard);
                    outcome
                }
                Outcome::Cancelled => Outcome::Cancelled,
                Outcome::Failed(e) => Outcome::Failed(e),
            };
            let _ = tx.send(StageReport {
                turn,
                report: Report::Generated(outcome),
            });
        });
    }

    fn spawn_speech(&self, turn: u64, text: String) {
        let tx = self.report_tx.clone();
        let Some(speaker) = self.speaker.clone() else {
            let _ = tx.send(StageReport {
                turn,
                report: Report::Spoken(Outcome::Completed(0)),
            });
            return;
        };
        let lease = self.audio_lease.clone();
        let cancel = self.cancel.clone();
        let playing = Arc::clone(&self.assistant_speaking);
        tokio::spawn(async move {
            let outcome = match lease.acquire(&cancel).await {
                Outcome::Completed(guard) => {
                    let flag = PlaybackFlag::raise(&playing);
                    let outcome = speaker.speak(&text, &cancel).await;
                    drop(flag);
                    drop(guard);
                    outcome
                }
                other => other.map(|_| 0),
            };
            let _ = tx.send(StageReport {
                turn,
                report: Report::Spoken(outcome),
            });
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.snapshot());
    }
}

/// Forward tokens to the orchestrator until the stream ends, cancelling it
/// when the turn is cancelled.
async fn consume_stream(
    mut stream: crate::llm::GenerationStream,
    turn: u64,
    tx: &mpsc::UnboundedSender<StageReport>,
    cancel: &CancellationToken,
) -> Outcome<(String, GenerationStats)> {
    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled(), if !stream.is_cancelled() => {
                stream.cancel();
                continue;
            }
            event = stream.next() => event,
        };
        match event {
            Some(StreamEvent::Token(token)) => {
                text.push_str(&token);
                let _ = tx.send(StageReport {
                    turn,
                    report: Report::Token(token),
                });
            }
            Some(StreamEvent::End(stats)) => return Outcome::Completed((text, stats)),
            Some(StreamEvent::Error(e)) => return Outcome::Failed(e),
            Some(StreamEvent::Cancelled) | None => return Outcome::Cancelled,
        }
    }
}
