//! Message types passed between pipeline stages.

use std::time::{Duration, Instant};

/// A chunk of raw audio samples from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at `sample_rate`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was captured.
    pub captured_at: Instant,
}

/// A complete utterance detected by VAD, ready for STT.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Concatenated audio samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the speech segment started.
    pub started_at: Instant,
}

impl SpeechSegment {
    /// Audio length.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// A transcription result from the STT backend.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// The transcribed text.
    pub text: String,
    /// Time the original audio started.
    pub audio_captured_at: Instant,
    /// Time the transcription completed.
    pub transcribed_at: Instant,
}

/// Synthesized audio for one speakable segment.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// What voice capture reports to the orchestrator.
#[derive(Debug, Clone)]
pub enum VoiceSignal {
    /// The user has been talking for the confirmation window.
    SpeechStarted {
        /// RMS energy of the most recent voiced chunk.
        rms: f32,
    },
    /// Speech reported by `SpeechStarted` ended before it was long enough
    /// to keep. No `Utterance` follows.
    SpeechDiscarded,
    /// The user stopped talking for long enough; here is what they said.
    Utterance(SpeechSegment),
}
