//! Voice Activity Detection using energy-based analysis.
//!
//! Uses RMS energy thresholding to detect speech boundaries. An utterance
//! is complete once the signal has stayed below the threshold for
//! `min_silence_duration_ms`; until then trailing silence is buffered with
//! the speech so short pauses do not split a sentence.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioChunk, SpeechSegment};
use std::time::Instant;
use tracing::{debug, info};

/// What a processed chunk meant.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// First voiced chunk of a new utterance.
    SpeechStarted,
    /// Voiced, or a pause shorter than the silence threshold.
    Speaking,
    /// The utterance ended and was long enough to keep.
    SpeechEnded(SpeechSegment),
    /// The utterance ended but was shorter than the minimum speech length.
    Discarded,
    /// Silence outside any utterance.
    Silence,
}

/// Voice activity detector using RMS energy thresholding.
#[derive(Debug)]
pub struct EnergyVad {
    /// Accumulated samples for the current speech segment.
    speech_buffer: Vec<f32>,
    /// Whether we are currently in a speech segment.
    in_speech: bool,
    /// Voiced samples in the current segment.
    voiced_samples: usize,
    /// Consecutive silent samples since the last voiced chunk.
    silent_samples: usize,
    /// When the current speech segment started.
    speech_start: Option<Instant>,
    /// Sample rate of the chunks seen so far.
    sample_rate: u32,
    /// RMS energy of the last processed chunk.
    last_rms: f32,
    threshold: f32,
    min_silence_ms: u32,
    min_speech_ms: u32,
}

impl EnergyVad {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        info!(
            "VAD initialized: threshold={}, min_silence={}ms, min_speech={}ms",
            config.threshold, config.min_silence_duration_ms, config.min_speech_duration_ms
        );
        Self {
            speech_buffer: Vec::new(),
            in_speech: false,
            voiced_samples: 0,
            silent_samples: 0,
            speech_start: None,
            sample_rate,
            last_rms: 0.0,
            threshold: config.threshold,
            min_silence_ms: config.min_silence_duration_ms,
            min_speech_ms: config.min_speech_duration_ms,
        }
    }

    /// Whether an utterance is in progress.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// RMS energy of the last processed chunk.
    pub fn last_rms(&self) -> f32 {
        self.last_rms
    }

    /// Whether the last processed chunk was above the speech threshold.
    pub fn last_voiced(&self) -> bool {
        self.last_rms > self.threshold
    }

    /// Process one audio chunk.
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> VadEvent {
        if chunk.sample_rate > 0 {
            self.sample_rate = chunk.sample_rate;
        }
        let energy = compute_rms_energy(&chunk.samples);
        self.last_rms = energy;
        let is_speech = energy > self.threshold;

        if is_speech {
            let started = !self.in_speech;
            if started {
                self.in_speech = true;
                self.speech_start = Some(chunk.captured_at);
                self.speech_buffer.clear();
                self.voiced_samples = 0;
                debug!(energy, "speech started");
            }
            self.silent_samples = 0;
            self.voiced_samples += chunk.samples.len();
            self.speech_buffer.extend_from_slice(&chunk.samples);
            return if started {
                VadEvent::SpeechStarted
            } else {
                VadEvent::Speaking
            };
        }

        if !self.in_speech {
            return VadEvent::Silence;
        }

        // Still append silence within tolerance
        self.silent_samples += chunk.samples.len();
        self.speech_buffer.extend_from_slice(&chunk.samples);
        if self.ms(self.silent_samples) < u64::from(self.min_silence_ms) {
            return VadEvent::Speaking;
        }

        self.in_speech = false;
        self.silent_samples = 0;
        let voiced_ms = self.ms(self.voiced_samples);
        if voiced_ms < u64::from(self.min_speech_ms) {
            debug!(voiced_ms, "utterance too short, discarded");
            self.speech_buffer.clear();
            return VadEvent::Discarded;
        }

        let segment = SpeechSegment {
            samples: std::mem::take(&mut self.speech_buffer),
            sample_rate: self.sample_rate,
            started_at: self.speech_start.take().unwrap_or(chunk.captured_at),
        };
        debug!(voiced_ms, "utterance complete");
        VadEvent::SpeechEnded(segment)
    }

    /// Reset the VAD state.
    pub fn reset(&mut self) {
        self.speech_buffer.clear();
        self.in_speech = false;
        self.voiced_samples = 0;
        self.silent_samples = 0;
        self.speech_start = None;
        self.last_rms = 0.0;
    }

    fn ms(&self, samples: usize) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples as u64 * 1000 / u64::from(self.sample_rate)
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
