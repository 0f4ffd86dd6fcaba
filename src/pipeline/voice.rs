//! Voice capture stage: microphone chunks in, speech signals out.

use crate::config::{BargeInConfig, VadConfig};
use crate::error::Outcome;
use crate::pipeline::messages::{AudioChunk, VoiceSignal};
use crate::vad::{EnergyVad, VadEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Speech that has started but not yet lasted `confirm_ms`.
#[derive(Debug, Clone, Copy)]
struct PendingStart {
    speech_samples: usize,
    rms: f32,
}

/// Tracks assistant playback so its echo is not mistaken for the user.
///
/// Suppression covers playback itself plus `tail` after it stops.
#[derive(Debug)]
struct EchoGate {
    playing: Option<Arc<AtomicBool>>,
    was_playing: bool,
    tail: Duration,
    until: Option<Instant>,
}

impl EchoGate {
    fn suppressing(&mut self, now: Instant) -> bool {
        let playing = self
            .playing
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        if self.was_playing && !playing {
            self.until = Some(now + self.tail);
        }
        self.was_playing = playing;
        playing || self.until.is_some_and(|t| now < t)
    }
}

/// Runs the VAD over captured audio and forwards what it hears.
///
/// `SpeechStarted` is sent once speech has lasted `confirm_ms`, so clicks
/// and bumps never reach the orchestrator. While the assistant is playing
/// (and for the echo tail after), quiet speech is treated as echo: its
/// start is not reported and its segment is dropped. Speech at or above
/// `min_rms` still gets through so the user can talk over the reply.
pub struct VoiceCapture {
    vad: EnergyVad,
    gate: EchoGate,
    confirm_ms: u32,
    min_rms: f32,
    pending: Option<PendingStart>,
    /// Whether `SpeechStarted` went out for the utterance in progress.
    signalled: bool,
}

impl VoiceCapture {
    pub fn new(vad: &VadConfig, barge_in: &BargeInConfig, sample_rate: u32) -> Self {
        Self {
            vad: EnergyVad::new(vad, sample_rate),
            gate: EchoGate {
                playing: None,
                was_playing: false,
                tail: Duration::from_millis(u64::from(barge_in.echo_tail_ms)),
                until: None,
            },
            confirm_ms: barge_in.confirm_ms,
            min_rms: barge_in.min_rms,
            pending: None,
            signalled: false,
        }
    }

    /// Watch `flag` (true while the assistant's audio is playing) for echo
    /// suppression. See [`crate::SessionHandle::assistant_speaking`].
    pub fn with_playback_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.gate.playing = Some(flag);
        self
    }

    /// Consume `rx` until cancelled or the audio source closes.
    ///
    /// Returns the number of utterances forwarded. A closed `tx` (the
    /// orchestrator went away) ends the stage as completed.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<AudioChunk>,
        tx: mpsc::Sender<VoiceSignal>,
        cancel: CancellationToken,
    ) -> Outcome<usize> {
        info!("voice capture stage started");
        let mut utterances = 0;
        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.vad.reset();
                    return Outcome::Cancelled;
                }
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                debug!("audio source closed");
                return Outcome::Completed(utterances);
            };

            for signal in self.process(&chunk) {
                if matches!(signal, VoiceSignal::Utterance(_)) {
                    utterances += 1;
                }
                if tx.send(signal).await.is_err() {
                    return Outcome::Completed(utterances);
                }
            }
        }
    }

    fn process(&mut self, chunk: &AudioChunk) -> Vec<VoiceSignal> {
        let suppressing = self.gate.suppressing(Instant::now());
        let event = self.vad.process_chunk(chunk);
        let rms = self.vad.last_rms();
        let mut signals = Vec::new();

        if matches!(event, VadEvent::SpeechStarted) {
            self.signalled = false;
        }

        // A non-speech chunk resets the confirmation window.
        if !self.vad.last_voiced() {
            self.pending = None;
        } else if !self.signalled {
            let p = self.pending.get_or_insert(PendingStart {
                speech_samples: 0,
                rms,
            });
            p.speech_samples = p.speech_samples.saturating_add(chunk.samples.len());
            p.rms = rms;
            let confirmed = *p;
            if confirmed.speech_samples >= ms_to_samples(chunk.sample_rate, self.confirm_ms) {
                self.pending = None;
                if suppressing && confirmed.rms < self.min_rms {
                    debug!(rms = confirmed.rms, "speech start suppressed during playback");
                } else {
                    self.signalled = true;
                    signals.push(VoiceSignal::SpeechStarted { rms: confirmed.rms });
                }
            }
        }

        match event {
            VadEvent::SpeechEnded(segment) => {
                let signalled = std::mem::take(&mut self.signalled);
                let duration_s = segment.duration().as_secs_f32();
                if suppressing && !signalled {
                    info!("dropping {duration_s:.1}s speech segment (echo suppression)");
                } else {
                    self.gate.until = None;
                    info!("utterance finalized ({duration_s:.2}s)");
                    signals.push(VoiceSignal::Utterance(segment));
                }
            }
            VadEvent::Discarded => {
                self.pending = None;
                if std::mem::take(&mut self.signalled) {
                    signals.push(VoiceSignal::SpeechDiscarded);
                }
            }
            VadEvent::SpeechStarted | VadEvent::Speaking | VadEvent::Silence => {}
        }
        signals
    }
}

fn ms_to_samples(sample_rate: u32, ms: u32) -> usize {
    (u64::from(sample_rate) * u64::from(ms) / 1000) as usize
}
