//! Audio capture and playback via cpal.

pub mod capture;
pub mod playback;

pub use capture::CpalCapture;
pub use playback::CpalSpeaker;

use crate::error::{ChatError, Outcome, Result};
use crate::pipeline::messages::SynthesizedAudio;
use async_trait::async_trait;
use cpal::traits::DeviceTrait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Somewhere synthesized speech can be played.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `audio` to the end, or stop within one buffer period once
    /// `cancel` fires and report [`Outcome::Cancelled`].
    async fn play(&self, audio: SynthesizedAudio, cancel: &CancellationToken) -> Outcome<()>;
}

/// Pick the named device, or the host default when `name` is `None`.
pub(crate) fn find_device<I, E>(
    name: Option<&str>,
    list: impl FnOnce() -> std::result::Result<I, E>,
    default: impl FnOnce() -> Option<cpal::Device>,
    kind: &str,
) -> Result<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
    E: std::fmt::Display,
{
    let device = match name {
        Some(name) => list()
            .map_err(|e| ChatError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|desc| desc.name() == name)
            })
            .ok_or_else(|| ChatError::Audio(format!("{kind} device '{name}' not found")))?,
        None => default().ok_or_else(|| ChatError::Audio(format!("no default {kind} device")))?,
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using {kind} device: {device_name}");
    Ok(device)
}
