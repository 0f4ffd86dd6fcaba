//! Error types for the colloquy pipeline.

/// Top-level error type for retrieval and conversation stages.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Bad chunking, retrieval, budget or device values. Fatal to the
    /// operation that was set up with them, nothing else.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An embedding, LLM, ASR or TTS backend could not be reached.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Vector dimension does not match the index dimension.
    #[error("dimension mismatch: index holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed by the first insert into the index.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },

    /// Speech-to-text transcription error.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// Language model generation error.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Text-to-speech synthesis or playback error.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// A device or model connection was still held by a cancelled worker
    /// when the release timeout ran out.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration file could not be parsed or serialized.
    #[error("config error: {0}")]
    Config(String),

    /// Index snapshot could not be read or written.
    #[error("index error: {0}")]
    Index(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl ChatError {
    /// Whether this error means a backend was unreachable rather than a
    /// stage failing on a reachable backend.
    pub fn is_backend_unreachable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Terminal result of a cancellable worker.
///
/// Cancellation is an expected outcome of an interrupt, so it is kept apart
/// from [`ChatError`].
#[derive(Debug)]
pub enum Outcome<T> {
    /// The worker ran to completion.
    Completed(T),
    /// The worker observed its cancellation signal and stopped.
    Cancelled,
    /// The worker failed.
    Failed(ChatError),
}

impl<T> Outcome<T> {
    /// Whether the worker was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the worker completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Short label for logs and runtime events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    /// Map the completed value, keeping cancellation and failure.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(v) => Outcome::Completed(f(v)),
            Self::Cancelled => Outcome::Cancelled,
            Self::Failed(e) => Outcome::Failed(e),
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => Self::Completed(v),
            Err(e) => Self::Failed(e),
        }
    }
}
