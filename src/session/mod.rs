//! Conversation session state and turn history.

pub mod state;
pub mod turn;

pub use state::{Phase, SessionSnapshot, SessionState, Trigger};
pub use turn::{ConversationTurn, HistoryStore, InMemoryHistory, Role};
