//! Stage wiring: message types, the voice capture stage and the session
//! orchestrator.

pub mod coordinator;
pub mod messages;
pub mod voice;

pub use coordinator::{SessionHandle, SessionOrchestrator};
pub use voice::VoiceCapture;
