//! Text-to-speech: an OpenAI-compatible speech server plus the sentence
//! worker that feeds it.
//!
//! Replies are split into sentences and each sentence is synthesized and
//! played before the next is requested, so an interrupt clips at most the
//! current sentence.

use crate::audio::AudioSink;
use crate::config::TtsConfig;
use crate::error::{ChatError, Outcome, Result};
use crate::llm::split_sentences;
use crate::pipeline::messages::SynthesizedAudio;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Converts one speakable segment into audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`.
    ///
    /// # Errors
    ///
    /// [`ChatError::ModelUnavailable`] when the backend cannot be reached,
    /// [`ChatError::Synthesis`] when it fails on a reachable backend.
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// HTTP client for `/v1/audio/speech` (Kokoro-FastAPI, openedai-speech).
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
    speed: f32,
}

impl HttpSynthesizer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::InvalidConfiguration(format!("http client: {e}")))?;
        let base_url = config
            .api_url
            .trim_end_matches('/')
            .trim_end_matches("/v1")
            .to_owned();
        info!(
            "TTS configured: {base_url} model={} voice={}",
            config.model, config.voice
        );
        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": self.speed,
            "response_format": "wav",
        });
        let url = format!("{}/v1/audio/speech", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ChatError::ModelUnavailable(format!(
                    "speech server unreachable at {}: {e}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::ModelUnavailable(format!(
                "speech endpoint or model '{}' not found",
                self.model
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Synthesis(format!(
                "server returned {status}: {body}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChatError::Synthesis(format!("reading audio body: {e}")))?;
        let audio = decode_wav(&bytes)?;
        debug!(
            samples = audio.samples.len(),
            rate = audio.sample_rate,
            "synthesized segment"
        );
        Ok(audio)
    }
}

/// Decode a WAV payload into mono f32 samples.
pub(crate) fn decode_wav(bytes: &[u8]) -> Result<SynthesizedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ChatError::Synthesis(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ChatError::Synthesis(format!("invalid WAV: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| ChatError::Synthesis(format!("invalid WAV: {e}")))?
        }
    };
    let samples = if spec.channels > 1 {
        crate::audio::capture::to_mono(&interleaved, spec.channels)
    } else {
        interleaved
    };
    Ok(SynthesizedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Speaks a reply sentence by sentence.
#[derive(Clone)]
pub struct Speaker {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
}

impl Speaker {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, sink: Arc<dyn AudioSink>) -> Self {
        Self { synthesizer, sink }
    }

    /// Synthesize and play `text`, checking `cancel` between and during
    /// segments.
    pub async fn speak(&self, text: &str, cancel: &CancellationToken) -> Outcome<usize> {
        let segments = split_sentences(text);
        let total = segments.len();
        for (i, segment) in segments.into_iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(spoken = i, total, "speech cancelled between segments");
                return Outcome::Cancelled;
            }
            let audio = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Cancelled,
                result = self.synthesizer.synthesize(&segment) => match result {
                    Ok(audio) => audio,
                    Err(e) => return Outcome::Failed(e),
                },
            };
            match self.sink.play(audio, cancel).await {
                Outcome::Completed(()) => {}
                Outcome::Cancelled => {
                    debug!(spoken = i, total, "speech cancelled mid-segment");
                    return Outcome::Cancelled;
                }
                Outcome::Failed(e) => return Outcome::Failed(e),
            }
        }
        Outcome::Completed(total)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn wav_bytes(samples: &[i16], rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                w.write_sample(s).unwrap();
            }
            w.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn config(url: &str) -> TtsConfig {
        TtsConfig {
            api_url: url.to_owned(),
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn decodes_stereo_int_wav_to_mono() {
        let bytes = wav_bytes(&[16384, 0, -16384, 0], 24_000, 2);
        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples.len(), 2);
        assert!((audio.samples[0] - 0.25).abs() < 1e-3);
        assert!((audio.samples[1] + 0.25).abs() < 1e-3);
    }

    #[test]
    fn garbage_is_synthesis_error() {
        let err = decode_wav(b"not a wav").unwrap_err();
        assert!(matches!(err, ChatError::Synthesis(_)));
    }

    #[tokio::test]
    async fn requests_wav_for_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({
                "input": "Hello there.",
                "voice": "af_heart",
                "response_format": "wav"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(wav_bytes(&[0, 100, 200], 24_000, 1)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tts = HttpSynthesizer::new(&config(&server.uri())).unwrap();
        let audio = tts.synthesize("Hello there.").await.unwrap();
        assert_eq!(audio.samples.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_server_is_model_unavailable() {
        let tts = HttpSynthesizer::new(&config("http://127.0.0.1:1")).unwrap();
        let err = tts.synthesize("hi").await.unwrap_err();
        assert!(err.is_backend_unreachable());
    }

    struct EchoSynth;

    #[async_trait]
    impl Synthesizer for EchoSynth {
        async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
            Ok(SynthesizedAudio {
                samples: vec![0.0; text.len()],
                sample_rate: 16_000,
            })
        }
    }

    /// Records segment lengths; cancels the token after `cancel_after` plays.
    struct RecordingSink {
        played: Mutex<Vec<usize>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, audio: SynthesizedAudio, _cancel: &CancellationToken) -> Outcome<()> {
            let mut played = self.played.lock().unwrap();
            played.push(audio.samples.len());
            if let Some((n, token)) = &self.cancel_after
                && played.len() == *n
            {
                token.cancel();
            }
            Outcome::Completed(())
        }
    }

    #[tokio::test]
    async fn speaks_every_sentence_in_order() {
        let sink = Arc::new(RecordingSink {
            played: Mutex::new(Vec::new()),
            cancel_after: None,
        });
        let speaker = Speaker::new(Arc::new(EchoSynth), sink.clone());
        let outcome = speaker
            .speak("First one. Second sentence here! Third?", &CancellationToken::new())
            .await;
        assert!(matches!(outcome, Outcome::Completed(3)));
        assert_eq!(sink.played.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancel_stops_before_next_segment() {
        let token = CancellationToken::new();
        let sink = Arc::new(RecordingSink {
            played: Mutex::new(Vec::new()),
            cancel_after: Some((1, token.clone())),
        });
        let speaker = Speaker::new(Arc::new(EchoSynth), sink.clone());
        let outcome = speaker.speak("One. Two. Three.", &token).await;
        assert!(outcome.is_cancelled());
        assert_eq!(sink.played.lock().unwrap().len(), 1);
    }
}
