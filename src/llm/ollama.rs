//! Ollama chat backend (`/api/chat`, newline-delimited JSON streaming).

use super::{
    ChatBackend, ChatMessage, GenerationOptions, GenerationStats, GenerationStream, LineBuffer,
    StreamSink, ThinkTagStripper, http_client,
};
use crate::config::LlmConfig;
use crate::error::{ChatError, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A model installed on the Ollama server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub details: ModelDetails,
}

/// Model metadata reported by `/api/tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelDetails {
    pub format: String,
    pub family: String,
    pub parameter_size: String,
    pub quantization_level: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// One NDJSON line of a streaming chat response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    done: bool,
    error: Option<String>,
    total_duration: Option<u64>,
    load_duration: Option<u64>,
    prompt_eval_count: Option<u64>,
    prompt_eval_duration: Option<u64>,
    eval_count: Option<u64>,
    eval_duration: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkMessage {
    content: String,
}

/// Streaming chat against a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaChat {
    /// Create a backend for the server and model named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = http_client(config.connect_timeout_secs)?;
        let base_url = config.api_url.trim_end_matches('/').to_owned();
        info!("Ollama LLM configured: {base_url} model={}", config.model);
        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], options: &GenerationOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), t.into());
        }
        if let Some(n) = options.num_ctx {
            opts.insert("num_ctx".into(), n.into());
        }
        if let Some(n) = options.num_predict {
            opts.insert("num_predict".into(), n.into());
        }
        if !opts.is_empty() {
            body["options"] = serde_json::Value::Object(opts);
        }
        body
    }

    /// Models installed on the server (`/api/tags`).
    ///
    /// # Errors
    ///
    /// [`ChatError::ModelUnavailable`] if the server cannot be reached or
    /// answers with an error.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&self.base_url, &e))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ChatError::ModelUnavailable(format!(
                "listing models failed with {status}: {body_text}"
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ChatError::ModelUnavailable(format!("invalid /api/tags response: {e}")))?;
        Ok(tags.models)
    }

    /// Whether `model` is installed (`/api/show`).
    ///
    /// # Errors
    ///
    /// [`ChatError::ModelUnavailable`] if the server cannot be reached.
    pub async fn model_exists(&self, model: &str) -> Result<bool> {
        let url = format!("{}/api/show", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await
            .map_err(|e| unreachable(&self.base_url, &e))?;
        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(ChatError::ModelUnavailable(format!(
                "checking model {model} failed with {status}"
            )))
        }
    }
}

impl ChatBackend for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn start(&self, messages: Vec<ChatMessage>, options: &GenerationOptions) -> GenerationStream {
        let (sink, stream) = GenerationStream::channel();
        let body = self.request_body(&messages, options);
        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);
        let base_url = self.base_url.clone();
        let model = self.model.clone();

        tokio::spawn(async move {
            let tokens = sink.clone();
            sink.drive(stream_chat(request, base_url, model, tokens))
                .await;
        });
        stream
    }
}

async fn stream_chat(
    request: reqwest::RequestBuilder,
    base_url: String,
    model: String,
    sink: StreamSink,
) -> Result<GenerationStats> {
    let started = Instant::now();
    let response = request
        .send()
        .await
        .map_err(|e| unreachable(&base_url, &e))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ChatError::ModelUnavailable(format!(
            "model {model} not available: {body_text}"
        )));
    }
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ChatError::Generation(format!(
            "Ollama chat failed with {status}: {body_text}"
        )));
    }

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut stripper = ThinkTagStripper::default();
    let mut stats = GenerationStats::default();

    loop {
        let (pending, eof) = match bytes.next().await {
            Some(chunk) => {
                let chunk =
                    chunk.map_err(|e| ChatError::Generation(format!("stream read error: {e}")))?;
                (lines.push(&chunk), false)
            }
            None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in pending {
            if line.trim().is_empty() {
                continue;
            }
            let chunk: ChatChunk = serde_json::from_str(&line)
                .map_err(|e| ChatError::Generation(format!("invalid chunk: {e}")))?;
            if let Some(error) = chunk.error {
                return Err(ChatError::Generation(error));
            }
            if let Some(message) = &chunk.message {
                let visible = stripper.push(&message.content);
                if !visible.is_empty() {
                    stats.tokens += 1;
                    if !sink.token(visible).await {
                        return Ok(stats);
                    }
                }
            }
            if chunk.done {
                let tail = stripper.finish();
                if !tail.is_empty() {
                    stats.tokens += 1;
                    sink.token(tail).await;
                }
                stats.elapsed = started.elapsed();
                stats.total_duration = chunk.total_duration.map(Duration::from_nanos);
                stats.load_duration = chunk.load_duration.map(Duration::from_nanos);
                stats.prompt_eval_duration = chunk.prompt_eval_duration.map(Duration::from_nanos);
                stats.eval_duration = chunk.eval_duration.map(Duration::from_nanos);
                stats.prompt_eval_count = chunk.prompt_eval_count;
                stats.eval_count = chunk.eval_count;
                info!(
                    "Ollama generated {} tokens in {:.1}s ({:.1} tok/s) [{}]",
                    stats.tokens,
                    stats.elapsed.as_secs_f64(),
                    stats.tokens_per_second(),
                    stats.summary()
                );
                return Ok(stats);
            }
        }

        if eof {
            warn!("Ollama stream ended without done marker");
            return Err(ChatError::Generation(
                "stream ended before the model finished".into(),
            ));
        }
    }
}

fn unreachable(base_url: &str, e: &reqwest::Error) -> ChatError {
    ChatError::ModelUnavailable(format!(
        "LLM server unreachable at {base_url} (is Ollama running?): {e}"
    ))
}
