//! Colloquy: local voice and text conversations with retrieval-augmented
//! context.
//!
//! Two halves cooperate on every turn:
//!
//! - **Retrieval** ([`rag`]): documents are chunked into overlapping
//!   fragments, embedded, and kept in an in-memory [`rag::VectorIndex`]; a
//!   [`rag::ContextAssembler`] picks the best fragments for a query under a
//!   token budget.
//! - **Orchestration** ([`pipeline`]): a [`SessionOrchestrator`] drives one
//!   turn at a time through listening, transcription, retrieval, streaming
//!   generation and speech, and lets the user interrupt any of them.
//!
//! Speech backends are external servers reached over HTTP; audio I/O goes
//! through `cpal`.

pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod rag;
pub mod runtime;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::ChatConfig;
pub use error::{ChatError, Outcome, Result};
pub use pipeline::coordinator::{SessionHandle, SessionOrchestrator};
pub use runtime::{RuntimeEvent, Stage};
pub use session::{Phase, SessionSnapshot};
