//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate and downsamples
//! to the pipeline rate (16kHz mono by default).

use super::find_device;
use crate::config::AudioConfig;
use crate::error::{ChatError, Result};
use crate::pipeline::messages::AudioChunk;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio capture from the system microphone.
///
/// The cpal stream lives on a blocking thread for as long as capture runs;
/// chunks reach async code through a bounded channel and are dropped, not
/// queued, when the consumer falls behind.
#[derive(Debug, Clone)]
pub struct CpalCapture {
    device_name: Option<String>,
    target_sample_rate: u32,
}

impl CpalCapture {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
            target_sample_rate: config.input_sample_rate,
        }
    }

    /// Start capturing into `tx` until `cancel` fires.
    ///
    /// Device errors surface through the returned handle. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        &self,
        tx: mpsc::Sender<AudioChunk>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let this = self.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            let stream = this.open_stream(tx)?;
            runtime.block_on(cancel.cancelled());
            drop(stream);
            info!("audio capture stopped");
            Ok(())
        })
    }

    fn open_stream(&self, tx: mpsc::Sender<AudioChunk>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = find_device(
            self.device_name.as_deref(),
            || host.input_devices(),
            || host.default_input_device(),
            "input",
        )?;

        // Use the device's default config for best compatibility
        let default_config = device
            .default_input_config()
            .map_err(|e| ChatError::Audio(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let target_rate = self.target_sample_rate;

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = resample(&mono, native_rate, target_rate);

                    let chunk = AudioChunk {
                        samples,
                        sample_rate: target_rate,
                        captured_at: Instant::now(),
                    };
                    // Never block the audio thread
                    if tx.try_send(chunk).is_err() {
                        debug!("audio channel full, dropping chunk");
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| ChatError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| ChatError::Audio(format!("failed to start input stream: {e}")))?;

        info!(
            "audio capture started: native {}Hz x{} -> target {}Hz",
            native_rate, native_channels, target_rate
        );
        Ok(stream)
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| ChatError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels.max(1));
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Adequate for speech: the energy of interest sits well below the
/// Nyquist frequency of the pipeline rates.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}
