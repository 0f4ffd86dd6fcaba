//! Session phases and the transition table.

use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Where the current turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Listening,
    Transcribing,
    Retrieving,
    Generating,
    Speaking,
}

impl Phase {
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    VoiceActivity,
    /// The speech that opened the turn was too short to keep.
    VoiceDiscarded,
    TextSubmitted,
    UtteranceFinalized,
    TranscriptReady,
    TranscriptionFailed,
    ContextAssembled,
    RetrievalFailed,
    StreamEnded,
    StreamFailed,
    PlaybackFinished,
    SynthesisFailed,
    Interrupt,
}

/// Next phase for `trigger` in `from`, or `None` if the trigger does not
/// apply there.
pub fn transition(from: Phase, trigger: Trigger) -> Option<Phase> {
    use Phase::*;
    use Trigger::*;
    match (from, trigger) {
        (Idle, VoiceActivity) => Some(Listening),
        (Idle, TextSubmitted) => Some(Retrieving),
        (Listening, UtteranceFinalized) => Some(Transcribing),
        (Listening, VoiceDiscarded) => Some(Idle),
        (Transcribing, TranscriptReady) => Some(Retrieving),
        (Transcribing, TranscriptionFailed) => Some(Idle),
        (Retrieving, ContextAssembled) => Some(Generating),
        (Retrieving, RetrievalFailed) => Some(Idle),
        (Generating, StreamEnded) => Some(Speaking),
        (Generating, StreamFailed) => Some(Idle),
        (Speaking, PlaybackFinished | SynthesisFailed) => Some(Idle),
        (Idle, Interrupt) => None,
        (_, Interrupt) => Some(Idle),
        _ => None,
    }
}

/// The single mutable record of one open conversation.
///
/// Owned by the orchestrator task; other parties see [`SessionSnapshot`]s.
#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    turn: u64,
    cancel: Option<CancellationToken>,
    interrupt_pending: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            turn: 0,
            cancel: None,
            interrupt_pending: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of the current (or last) turn.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_pending
    }

    /// Apply `trigger`. Returns the new phase, or `None` (state unchanged)
    /// if the trigger does not apply in the current phase.
    ///
    /// Reaching Idle ends the turn, so its token is cancelled and released.
    pub fn apply(&mut self, trigger: Trigger) -> Option<Phase> {
        let next = transition(self.phase, trigger)?;
        self.phase = next;
        if next.is_idle()
            && let Some(token) = self.cancel.take()
        {
            token.cancel();
        }
        Some(next)
    }

    /// Open a new turn from Idle. Returns its number and its cancellation
    /// token.
    pub fn begin_turn(&mut self) -> (u64, CancellationToken) {
        self.turn += 1;
        self.interrupt_pending = false;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        (self.turn, token)
    }

    /// Cancellation token of the active turn.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Interrupt the active turn: cancel its workers and return to Idle.
    ///
    /// Returns the phase that was interrupted, or `None` if already Idle.
    pub fn interrupt(&mut self) -> Option<Phase> {
        let from = self.phase;
        self.interrupt_pending = true;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        let next = self.apply(Trigger::Interrupt);
        self.interrupt_pending = false;
        next.map(|_| from)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            turn: self.turn,
            interrupt_pending: self.interrupt_pending,
        }
    }
}

/// Read-only view of [`SessionState`] published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub turn: u64,
    pub interrupt_pending: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionState::new().snapshot()
    }
}
