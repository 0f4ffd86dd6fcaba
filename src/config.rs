//! Configuration types for the retrieval pipeline and conversation session.
//!
//! Values are consumed as plain settings; [`ChatConfig::validate`] rejects
//! combinations the pipeline cannot run with.

use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default system prompt for plain chat.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant running locally on the \
user's machine. Keep spoken answers short and conversational.";

/// Default context prompt appended to the system prompt when retrieved
/// context is present.
const DEFAULT_CONTEXT_PROMPT: &str = "You provide accurate answers based on the given context.
Follow these guidelines:
1. Only use information from the provided context
2. If the context doesn't contain enough information, acknowledge the limitations
3. Maintain a natural, conversational tone while being precise";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Chunking and retrieval settings.
    pub rag: RagConfig,
    /// Embedding backend settings.
    pub embedding: EmbeddingConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Barge-in and echo suppression.
    pub barge_in: BargeInConfig,
    /// Orchestrator behaviour.
    pub session: SessionConfig,
}

/// Chunking and retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Maximum fragment length in bytes of UTF-8 text. Fragments are cut on
    /// character boundaries, so a fragment never splits a code point.
    pub chunk_size: usize,
    /// Bytes shared between consecutive fragments. Must be smaller
    /// than `chunk_size`.
    pub overlap: usize,
    /// Number of nearest fragments retrieved per query.
    pub top_k: usize,
    /// Token budget for the assembled context block.
    pub token_budget: usize,
    /// Fragments scoring below this cosine similarity are ignored.
    pub min_relevance: f32,
    /// Upper bound on stored fragments (0 = unbounded).
    pub max_fragments: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
            top_k: 5,
            token_budget: 4000,
            min_relevance: 0.0,
            max_fragments: 0,
        }
    }
}

/// Which embedding backend to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Local Ollama server (`/api/embed`).
    #[default]
    Ollama,
    /// Offline feature-hashing embedder (no model required).
    Hashing,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which backend produces vectors.
    pub backend: EmbeddingBackend,
    /// Base URL of the embedding server.
    pub api_url: String,
    /// Embedding model name.
    pub model: String,
    /// Vector dimension for the hashing backend.
    pub dims: usize,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Ollama,
            api_url: "http://localhost:11434".to_owned(),
            model: "all-minilm".to_owned(),
            dims: 384,
            timeout_secs: 30,
        }
    }
}

/// Which chat backend serves token streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Ollama `/api/chat` NDJSON streaming.
    #[default]
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions` SSE streaming.
    Api,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Which backend to use for inference.
    pub backend: LlmBackend,
    /// Base URL of the model server.
    pub api_url: String,
    /// Model name requested from the server.
    pub model: String,
    /// Bearer token for OpenAI-compatible servers (usually empty locally).
    pub api_key: String,
    /// System prompt sent first in every request.
    pub system_prompt: String,
    /// Instructions appended to the system prompt when context is present.
    pub context_prompt: String,
    /// Sampling temperature. Unset leaves the server default.
    pub temperature: Option<f64>,
    /// Context window size in tokens. Unset leaves the server default.
    pub num_ctx: Option<u32>,
    /// Maximum tokens to generate. Unset leaves the server default.
    pub num_predict: Option<u32>,
    /// When true, prior turns are not sent to the model.
    pub disable_chat_history: bool,
    /// Maximum number of history messages sent with a prompt (0 = all).
    pub max_history_messages: usize,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Ollama,
            api_url: "http://localhost:11434".to_owned(),
            model: "llama3.1:8b-instruct-q4_0".to_owned(),
            api_key: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            context_prompt: DEFAULT_CONTEXT_PROMPT.to_owned(),
            temperature: None,
            num_ctx: None,
            num_predict: None,
            disable_chat_history: false,
            max_history_messages: 24,
            connect_timeout_secs: 10,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection (f32 samples in \[-1, 1\]).
    pub threshold: f32,
    /// Silence duration in ms that completes an utterance.
    pub min_silence_duration_ms: u32,
    /// Minimum speech duration in ms for an utterance to be kept.
    pub min_speech_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            min_silence_duration_ms: 1200,
            min_speech_duration_ms: 300,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Pipeline input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            input_device: None,
            output_device: None,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Base URL of a Whisper-compatible transcription server.
    pub api_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Optional ISO-639-1 language hint.
    pub language: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_owned(),
            model: "openai/whisper-small.en".to_owned(),
            language: None,
            timeout_secs: 60,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible speech server.
    pub api_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Voice name.
    pub voice: String,
    /// Speaking speed multiplier.
    pub speed: f32,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8880".to_owned(),
            model: "kokoro".to_owned(),
            voice: "af_heart".to_owned(),
            speed: 1.0,
            timeout_secs: 60,
        }
    }
}

/// Barge-in configuration (user interrupts the assistant by speaking).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Whether detected speech interrupts an in-flight turn.
    pub enabled: bool,
    /// Minimum RMS energy of a speech start for it to count as a barge-in.
    ///
    /// Speaker leakage picked up by the microphone is usually quieter than
    /// a user talking over the assistant.
    pub min_rms: f32,
    /// Continuous speech (ms) required before a speech start is reported.
    pub confirm_ms: u32,
    /// Ignore barge-in for this long after playback starts (ms).
    pub assistant_start_holdoff_ms: u32,
    /// After playback ends, keep suppressing quiet speech for this long (ms)
    /// so the room echo of the reply does not open a new turn.
    pub echo_tail_ms: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_rms: 0.05,
            confirm_ms: 150,
            assistant_start_holdoff_ms: 500,
            echo_tail_ms: 1500,
        }
    }
}

/// Orchestrator behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a cancelled worker may hold a device or model connection
    /// before the next worker gives up with [`ChatError::DeviceBusy`].
    pub release_timeout_ms: u64,
    /// Capacity of the runtime event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            release_timeout_ms: 2000,
            event_capacity: 256,
        }
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ChatError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/colloquy/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("colloquy").join("config.toml")
        } else if let Some(dir) = dirs::config_dir() {
            dir.join("colloquy").join("config.toml")
        } else {
            std::env::temp_dir().join("colloquy").join("config.toml")
        }
    }

    /// Check that the settings describe a runnable pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidConfiguration`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.rag.validate()?;

        let temperature_ok = self
            .llm
            .temperature
            .is_none_or(|t| t.is_finite() && t >= 0.0);
        if !temperature_ok {
            return Err(invalid("llm.temperature must be a non-negative number"));
        }
        if self.embedding.backend == EmbeddingBackend::Hashing && self.embedding.dims == 0 {
            return Err(invalid("embedding.dims must be positive"));
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(invalid("audio sample rates must be positive"));
        }
        if self.vad.min_silence_duration_ms == 0 {
            return Err(invalid("vad.min_silence_duration_ms must be positive"));
        }
        if !(self.barge_in.min_rms.is_finite() && self.barge_in.min_rms >= 0.0) {
            return Err(invalid("barge_in.min_rms must be a non-negative number"));
        }
        if !(self.tts.speed > 0.0) {
            return Err(invalid("tts.speed must be positive"));
        }
        Ok(())
    }
}

impl RagConfig {
    /// Validate chunking and retrieval values.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidConfiguration`] for zero sizes, an overlap
    /// not smaller than the chunk size, or an out-of-range relevance floor.
    pub fn validate(&self) -> Result<()> {
        validate_chunking(self.chunk_size, self.overlap)?;
        if self.top_k == 0 {
            return Err(invalid("rag.top_k must be positive"));
        }
        if !(-1.0..=1.0).contains(&self.min_relevance) {
            return Err(invalid("rag.min_relevance must lie in [-1, 1]"));
        }
        Ok(())
    }
}

/// Shared chunk-size/overlap check used by the chunker and config loading.
pub(crate) fn validate_chunking(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 || overlap == 0 {
        return Err(invalid("chunk size and overlap must be positive integers"));
    }
    if overlap >= chunk_size {
        return Err(ChatError::InvalidConfiguration(format!(
            "overlap ({overlap}) must be smaller than chunk size ({chunk_size})"
        )));
    }
    Ok(())
}

fn invalid(msg: &str) -> ChatError {
    ChatError::InvalidConfiguration(msg.to_owned())
}
