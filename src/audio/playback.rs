//! Audio playback to system speakers via cpal.

use super::{AudioSink, find_device};
use crate::config::AudioConfig;
use crate::error::{ChatError, Outcome, Result};
use crate::pipeline::messages::SynthesizedAudio;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How often the blocking playback loop checks for completion or cancel.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Speaker output through cpal.
///
/// Each call opens a short-lived output stream on a blocking thread at the
/// audio's own sample rate.
#[derive(Debug, Clone)]
pub struct CpalSpeaker {
    device_name: Option<String>,
}

impl CpalSpeaker {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
        }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| ChatError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

#[async_trait]
impl AudioSink for CpalSpeaker {
    async fn play(&self, audio: SynthesizedAudio, cancel: &CancellationToken) -> Outcome<()> {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        let device_name = self.device_name.clone();
        let cancel = cancel.clone();
        let joined = tokio::task::spawn_blocking(move || {
            play_blocking(device_name.as_deref(), &audio, &cancel)
        })
        .await;
        match joined {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(ChatError::Audio(format!("playback task failed: {e}"))),
        }
    }
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn play_blocking(
    device_name: Option<&str>,
    audio: &SynthesizedAudio,
    cancel: &CancellationToken,
) -> Outcome<()> {
    let host = cpal::default_host();
    let device = match find_device(
        device_name,
        || host.output_devices(),
        || host.default_output_device(),
        "output",
    ) {
        Ok(d) => d,
        Err(e) => return Outcome::Failed(e),
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: audio.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: audio.samples.clone(),
        position: 0,
        finished: audio.samples.is_empty(),
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
            let Ok(mut buf) = buffer_clone.lock() else {
                return;
            };
            for sample in data.iter_mut() {
                if buf.position < buf.samples.len() {
                    *sample = buf.samples[buf.position];
                    buf.position += 1;
                } else {
                    *sample = 0.0;
                    buf.finished = true;
                }
            }
        },
        move |err| {
            error!("audio output stream error: {err}");
        },
        None,
    );
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            return Outcome::Failed(ChatError::Audio(format!(
                "failed to build output stream: {e}"
            )));
        }
    };
    if let Err(e) = stream.play() {
        return Outcome::Failed(ChatError::Audio(format!(
            "failed to start output stream: {e}"
        )));
    }

    loop {
        std::thread::sleep(POLL_INTERVAL);
        if cancel.is_cancelled() {
            debug!("playback cancelled");
            drop(stream);
            return Outcome::Cancelled;
        }
        match buffer.lock() {
            Ok(buf) if buf.finished => break,
            Ok(_) => {}
            Err(e) => {
                return Outcome::Failed(ChatError::Audio(format!(
                    "playback buffer lock poisoned: {e}"
                )));
            }
        }
    }

    drop(stream);
    Outcome::Completed(())
}
