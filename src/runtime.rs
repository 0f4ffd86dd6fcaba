//! Runtime events emitted by the orchestrator for UI and observability.
//!
//! Payloads are owned and cheap to clone; the orchestrator never waits on
//! a slow subscriber (lagging receivers miss events, see
//! [`tokio::sync::broadcast`]).

use crate::llm::GenerationStats;
use crate::rag::ScoredFragment;
use crate::session::{ConversationTurn, Phase};
use std::fmt;

/// The worker a report or error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcription,
    Retrieval,
    Generation,
    Playback,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::Playback => "playback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session is doing right now.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The state machine moved.
    PhaseChanged { turn: u64, from: Phase, to: Phase },
    /// User speech was transcribed.
    Transcript { turn: u64, text: String },
    /// Fragments that made it into the context block, best first.
    Citations {
        turn: u64,
        fragments: Vec<ScoredFragment>,
    },
    /// Visible assistant text delta.
    Token { turn: u64, text: String },
    /// The model finished the reply.
    GenerationFinished { turn: u64, stats: GenerationStats },
    /// A turn was handed to the history store.
    TurnFinalized(ConversationTurn),
    /// The turn was interrupted while in `phase`.
    Cancelled { turn: u64, phase: Phase },
    /// A worker returned. `outcome` is `completed`, `cancelled` or
    /// `failed`, reported even for turns that were already interrupted.
    WorkerFinished {
        turn: u64,
        stage: Stage,
        outcome: &'static str,
    },
    /// A stage failed and the turn was aborted.
    Error {
        turn: u64,
        stage: Stage,
        message: String,
        /// The backend could not be reached at all.
        backend_unreachable: bool,
    },
}
