//! Speech-to-text against an OpenAI-compatible transcription server.
//!
//! Segments are encoded as 16-bit mono WAV and posted as multipart form data
//! to `/v1/audio/transcriptions` (faster-whisper-server, whisper.cpp server,
//! speaches and friends all speak this).

use crate::config::SttConfig;
use crate::error::{ChatError, Result};
use crate::pipeline::messages::{SpeechSegment, Transcription};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Turns a finished utterance into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one speech segment.
    ///
    /// # Errors
    ///
    /// [`ChatError::ModelUnavailable`] when the backend cannot be reached,
    /// [`ChatError::Transcription`] when it rejects or mangles the request.
    async fn transcribe(&self, segment: &SpeechSegment) -> Result<Transcription>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// HTTP transcription client.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
    language: Option<String>,
}

impl HttpTranscriber {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::InvalidConfiguration(format!("http client: {e}")))?;
        let base_url = config
            .api_url
            .trim_end_matches('/')
            .trim_end_matches("/v1")
            .to_owned();
        info!("STT configured: {base_url} model={}", config.model);
        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, segment: &SpeechSegment) -> Result<Transcription> {
        let wav = encode_wav(&segment.samples, segment.sample_rate)?;
        info!(
            "transcribing {:.1}s audio segment",
            segment.duration().as_secs_f32()
        );

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ChatError::Transcription(format!("bad mime type: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                ChatError::ModelUnavailable(format!(
                    "transcription server unreachable at {}: {e}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::ModelUnavailable(format!(
                "transcription endpoint or model '{}' not found",
                self.model
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Transcription(format!(
                "server returned {status}: {body}"
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Transcription(format!("invalid response: {e}")))?;
        let text = parsed.text.trim().to_owned();
        debug!(chars = text.len(), "transcription received");

        Ok(Transcription {
            text,
            audio_captured_at: segment.started_at,
            transcribed_at: Instant::now(),
        })
    }
}

/// Encode mono f32 samples as 16-bit PCM WAV.
pub(crate) fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| ChatError::Transcription(format!("wav encode: {e}")))?;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(v)
                .map_err(|e| ChatError::Transcription(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| ChatError::Transcription(format!("wav encode: {e}")))?;
    }
    Ok(cursor.into_inner())
}
