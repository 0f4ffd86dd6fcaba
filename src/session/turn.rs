//! Conversation turns and the history store they are handed to.

use crate::error::Result;
use crate::rag::FragmentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One finalized message in the conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    /// Session turn number this message belongs to.
    pub turn: u64,
    pub role: Role,
    pub text: String,
    /// Context block the model actually saw, if any.
    pub context: Option<String>,
    /// Fragments cited by `context`.
    #[serde(default)]
    pub citations: Vec<FragmentId>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(turn: u64, role: Role, text: impl Into<String>, context: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            turn,
            role,
            text: text.into(),
            context,
            citations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_citations(mut self, citations: Vec<FragmentId>) -> Self {
        self.citations = citations;
        self
    }
}

/// Reads prior turns for prompt history and receives finalized ones.
///
/// Persistence format is up to the implementation.
pub trait HistoryStore: Send + Sync {
    /// All stored turns, oldest first.
    fn turns(&self) -> Vec<ConversationTurn>;

    /// Store a finalized turn.
    ///
    /// # Errors
    ///
    /// Implementation-specific persistence failures.
    fn append(&self, turn: ConversationTurn) -> Result<()>;
}

/// Process-local history, lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    turns: Mutex<Vec<ConversationTurn>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously saved turns.
    pub fn with_turns(turns: Vec<ConversationTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
        }
    }
}

impl HistoryStore for InMemoryHistory {
    fn turns(&self) -> Vec<ConversationTurn> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn append(&self, turn: ConversationTurn) -> Result<()> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn);
        Ok(())
    }
}
