//! OpenAI-compatible API backend for LLM inference.
//!
//! Supports any server implementing the OpenAI chat completions API:
//! - Ollama (`http://localhost:11434/v1`)
//! - MLX server (`http://localhost:8080`)
//! - vLLM, llama.cpp server, etc.
//!
//! Responses are streamed as Server-Sent Events.

use super::{
    ChatBackend, ChatMessage, GenerationOptions, GenerationStats, GenerationStream, LineBuffer,
    StreamSink, ThinkTagStripper, http_client,
};
use crate::config::LlmConfig;
use crate::error::{ChatError, Result};
use futures_util::StreamExt;
use std::time::Instant;
use tracing::info;

/// LLM backend using an OpenAI-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChat {
    /// Create a new API-based backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = http_client(config.connect_timeout_secs)?;
        let base = config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base).to_owned();
        info!("API LLM configured: {base} model={}", config.model);
        Ok(Self {
            client,
            base_url: base,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], options: &GenerationOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = t.into();
        }
        if let Some(n) = options.num_predict {
            body["max_tokens"] = n.into();
        }
        body
    }
}

impl ChatBackend for OpenAiChat {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn start(&self, messages: Vec<ChatMessage>, options: &GenerationOptions) -> GenerationStream {
        let (sink, stream) = GenerationStream::channel();
        let body = self.request_body(&messages, options);
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let base_url = self.base_url.clone();

        tokio::spawn(async move {
            let tokens = sink.clone();
            sink.drive(stream_completions(request, base_url, tokens))
                .await;
        });
        stream
    }
}

/// What one SSE `data:` payload means for the stream.
#[derive(Debug, PartialEq)]
enum SseData {
    Delta(String),
    Usage { prompt: u64, completion: u64 },
    Finish,
    Done,
    Ignore,
}

fn parse_data(data: &str) -> Result<Vec<SseData>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(vec![SseData::Done]);
    }
    let chunk: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ChatError::Generation(format!("JSON parse error: {e}")))?;

    if let Some(error) = chunk.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return Err(ChatError::Generation(message.to_owned()));
    }

    let mut out = Vec::new();
    if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str()
        && !content.is_empty()
    {
        out.push(SseData::Delta(content.to_owned()));
    }
    if let (Some(prompt), Some(completion)) = (
        chunk["usage"]["prompt_tokens"].as_u64(),
        chunk["usage"]["completion_tokens"].as_u64(),
    ) {
        out.push(SseData::Usage { prompt, completion });
    }
    if chunk["choices"][0]["finish_reason"].is_string() {
        out.push(SseData::Finish);
    }
    if out.is_empty() {
        out.push(SseData::Ignore);
    }
    Ok(out)
}

async fn stream_completions(
    request: reqwest::RequestBuilder,
    base_url: String,
    sink: StreamSink,
) -> Result<GenerationStats> {
    let started = Instant::now();
    let response = request.send().await.map_err(|e| {
        ChatError::ModelUnavailable(format!("LLM server unreachable at {base_url}: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        let message = format!("API request failed with {status}: {body_text}");
        return Err(if status == reqwest::StatusCode::NOT_FOUND {
            ChatError::ModelUnavailable(message)
        } else {
            ChatError::Generation(message)
        });
    }

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut stripper = ThinkTagStripper::default();
    let mut stats = GenerationStats::default();
    let mut finished = false;

    'read: loop {
        let (pending, eof) = match bytes.next().await {
            Some(chunk) => {
                let chunk =
                    chunk.map_err(|e| ChatError::Generation(format!("read error: {e}")))?;
                (lines.push(&chunk), false)
            }
            None => (lines.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in pending {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            for item in parse_data(data)? {
                match item {
                    SseData::Delta(text) => {
                        let visible = stripper.push(&text);
                        if !visible.is_empty() {
                            stats.tokens += 1;
                            if !sink.token(visible).await {
                                return Ok(stats);
                            }
                        }
                    }
                    SseData::Usage { prompt, completion } => {
                        stats.prompt_eval_count = Some(prompt);
                        stats.eval_count = Some(completion);
                    }
                    SseData::Finish => finished = true,
                    SseData::Done => break 'read,
                    SseData::Ignore => {}
                }
            }
        }

        if eof {
            if finished {
                break;
            }
            return Err(ChatError::Generation(
                "stream ended before the model finished".into(),
            ));
        }
    }

    let tail = stripper.finish();
    if !tail.is_empty() {
        stats.tokens += 1;
        sink.token(tail).await;
    }
    stats.elapsed = started.elapsed();
    info!(
        "API generated {} tokens in {:.1}s ({:.1} tok/s)",
        stats.tokens,
        stats.elapsed.as_secs_f64(),
        stats.tokens_per_second()
    );
    Ok(stats)
}
