//! Language model generation.
//!
//! Provides two streaming backends behind [`ChatBackend`]:
//! - **Ollama** (default): `/api/chat` with newline-delimited JSON chunks.
//! - **API**: any OpenAI-compatible `/v1/chat/completions` server (SSE).
//!
//! A backend call returns a [`GenerationStream`] immediately; the HTTP work
//! runs on a spawned task that feeds the stream through a bounded channel
//! and stops as soon as the stream is cancelled.

pub mod api;
pub mod ollama;
pub mod prompt;

pub use api::OpenAiChat;
pub use ollama::{ModelInfo, OllamaChat};
pub use prompt::{ChatMessage, MessageRole, build_messages};

use crate::config::{LlmBackend, LlmConfig};
use crate::error::{ChatError, Outcome, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Channel capacity between a backend task and its stream handle.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Sampling options forwarded to the backend only when set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub num_ctx: Option<u32>,
    pub num_predict: Option<u32>,
}

impl GenerationOptions {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            num_ctx: config.num_ctx,
            num_predict: config.num_predict,
        }
    }
}

/// Timing and token counts for one finished generation.
///
/// Backend-reported fields are `None` when the server does not provide
/// them (OpenAI-compatible servers usually don't).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    /// Visible token deltas delivered to the stream.
    pub tokens: usize,
    /// Wall-clock time from request to end-of-stream.
    pub elapsed: Duration,
    pub total_duration: Option<Duration>,
    pub load_duration: Option<Duration>,
    pub prompt_eval_duration: Option<Duration>,
    pub eval_duration: Option<Duration>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

impl GenerationStats {
    /// Delivered deltas per second of wall-clock time.
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }

    /// Compact one-line summary, e.g.
    /// `Total:1.52s|Load:12.30ms|Prompt:80.00ms|Eval:1.40s|Tokens:42|Evals:67`.
    ///
    /// Durations under a millisecond and unreported durations are omitted.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (label, value) in [
            ("Total", self.total_duration),
            ("Load", self.load_duration),
            ("Prompt", self.prompt_eval_duration),
            ("Eval", self.eval_duration),
        ] {
            if let Some(text) = value.and_then(format_duration) {
                parts.push(format!("{label}:{text}"));
            }
        }
        let prompt_tokens = self.prompt_eval_count.unwrap_or(0);
        let evals = self.eval_count.unwrap_or(self.tokens as u64);
        parts.push(format!("Tokens:{prompt_tokens}"));
        parts.push(format!("Evals:{evals}"));
        parts.join("|")
    }
}

fn format_duration(d: Duration) -> Option<String> {
    let ns = d.as_nanos();
    if ns >= 1_000_000_000 {
        Some(format!("{:.2}s", d.as_secs_f64()))
    } else if ns >= 1_000_000 {
        Some(format!("{:.2}ms", ns as f64 / 1e6))
    } else {
        None
    }
}

/// One item of a generation stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// Visible text delta.
    Token(String),
    /// Normal end of stream.
    End(GenerationStats),
    /// The backend failed; the stream is over.
    Error(ChatError),
    /// The stream was cancelled; the stream is over.
    Cancelled,
}

impl StreamEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// Consumer handle for one generation call.
///
/// Produces a finite, non-restartable sequence of [`StreamEvent`]s ending
/// with exactly one terminal event (`End`, `Error` or `Cancelled`), after
/// which [`GenerationStream::next`] returns `None`.
///
/// [`GenerationStream::cancel`] is idempotent. Tokens that were already
/// buffered when it was called are still delivered, then the stream ends
/// with `Cancelled`; a backend error racing with cancellation is not
/// reported.
#[derive(Debug)]
pub struct GenerationStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl GenerationStream {
    /// Create a connected producer/consumer pair.
    pub fn channel() -> (StreamSink, GenerationStream) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        (
            StreamSink {
                tx,
                cancel: cancel.clone(),
            },
            GenerationStream {
                rx,
                cancel,
                finished: false,
            },
        )
    }

    /// A stream that fails immediately with `error`.
    pub fn failed(error: ChatError) -> Self {
        let (sink, stream) = Self::channel();
        // Capacity is never zero, so the first send always fits.
        let _ = sink.tx.try_send(StreamEvent::Error(error));
        stream
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that cancels this stream when triggered, for handing to
    /// another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once a terminal event has been returned.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(self.drain_cancelled());
        }

        let event = tokio::select! {
            biased;
            event = self.rx.recv() => match event {
                Some(event) => event,
                None if self.cancel.is_cancelled() => StreamEvent::Cancelled,
                None => StreamEvent::Error(ChatError::Generation(
                    "backend stopped without an end-of-stream marker".into(),
                )),
            },
            () = self.cancel.cancelled() => return Some(self.drain_cancelled()),
        };
        if event.is_terminal() {
            self.finish();
        }
        Some(event)
    }

    /// After cancellation: hand out buffered tokens, then `Cancelled`.
    fn drain_cancelled(&mut self) -> StreamEvent {
        match self.rx.try_recv() {
            Ok(StreamEvent::Token(text)) => StreamEvent::Token(text),
            _ => {
                self.finish();
                StreamEvent::Cancelled
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
        // Stop the producer if it is still running.
        self.cancel.cancel();
    }

    /// Consume the stream, concatenating tokens.
    pub async fn collect_text(mut self) -> Outcome<(String, GenerationStats)> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(t) => text.push_str(&t),
                StreamEvent::End(stats) => return Outcome::Completed((text, stats)),
                StreamEvent::Error(e) => return Outcome::Failed(e),
                StreamEvent::Cancelled => return Outcome::Cancelled,
            }
        }
        Outcome::Cancelled
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer side of a [`GenerationStream`], held by backend tasks.
#[derive(Debug, Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamSink {
    /// Send a token. Returns `false` once the consumer is gone or the
    /// stream was cancelled; the producer should stop.
    pub async fn token(&self, text: String) -> bool {
        if text.is_empty() {
            return !self.is_cancelled();
        }
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(StreamEvent::Token(text)).await.is_ok()
    }

    /// Finish normally.
    pub async fn end(self, stats: GenerationStats) {
        let _ = self.tx.send(StreamEvent::End(stats)).await;
    }

    /// Finish with an error.
    pub async fn fail(self, error: ChatError) {
        let _ = self.tx.send(StreamEvent::Error(error)).await;
    }

    /// Whether the consumer cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer cancels.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Run `work` to completion unless cancelled first, then emit the
    /// matching terminal event. Dropping `work` on cancellation aborts any
    /// in-flight request.
    pub async fn drive<F>(self, work: F)
    where
        F: std::future::Future<Output = Result<GenerationStats>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("generation cancelled before completion");
            }
            result = work => match result {
                Ok(stats) => self.end(stats).await,
                Err(e) => self.fail(e).await,
            },
        }
    }
}

/// A chat model reachable over some transport.
pub trait ChatBackend: Send + Sync {
    /// Backend label for logs.
    fn name(&self) -> &str;

    /// Model identifier requested from the server.
    fn model(&self) -> &str;

    /// Start generating a reply to `messages`.
    ///
    /// Returns immediately; failures are delivered through the stream.
    /// Must be called from within a tokio runtime.
    fn start(&self, messages: Vec<ChatMessage>, options: &GenerationOptions) -> GenerationStream;
}

/// Build the chat backend selected by `config`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build_backend(config: &LlmConfig) -> Result<Arc<dyn ChatBackend>> {
    match config.backend {
        LlmBackend::Ollama => Ok(Arc::new(OllamaChat::new(config)?)),
        LlmBackend::Api => Ok(Arc::new(OpenAiChat::new(config)?)),
    }
}

pub(crate) fn http_client(connect_timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .build()
        .map_err(|e| ChatError::InvalidConfiguration(format!("http client: {e}")))
}

/// Splits a byte stream into complete lines, buffering partial lines (and
/// partial UTF-8 sequences) across chunks.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `chunk` and return every completed line without its `\n`/`\r\n`.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.strip_suffix('\r').unwrap_or(&line).to_owned());
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).into_owned();
        Some(line.trim_end_matches('\r').to_owned())
    }
}

/// Incrementally strips `<think>...</think>` blocks across streaming chunks.
#[derive(Debug, Default)]
pub struct ThinkTagStripper {
    in_think_block: bool,
    carry: String,
}

impl ThinkTagStripper {
    const OPEN: &'static str = "<think>";
    const CLOSE: &'static str = "</think>";

    /// Feed one fragment and return newly-visible text (outside think blocks).
    pub fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        self.carry.push_str(fragment);

        let mut visible = String::new();
        loop {
            if self.in_think_block {
                if let Some(end) = self.carry.find(Self::CLOSE) {
                    self.carry.drain(..end + Self::CLOSE.len());
                    self.in_think_block = false;
                    continue;
                }
                // Keep only the minimal suffix needed to detect `</think>` across chunks.
                let drain = split_keeping_suffix(&self.carry, Self::CLOSE.len() - 1);
                self.carry.drain(..drain);
                break;
            }

            if let Some(start) = self.carry.find(Self::OPEN) {
                visible.push_str(&self.carry[..start]);
                self.carry.drain(..start + Self::OPEN.len());
                self.in_think_block = true;
                continue;
            }

            // Hold back a suffix in case the next chunk completes a tag.
            let emit = split_keeping_suffix(&self.carry, Self::CLOSE.len() - 1);
            visible.push_str(&self.carry[..emit]);
            self.carry.drain(..emit);
            break;
        }

        visible
    }

    /// Flush any remaining visible tail.
    pub fn finish(&mut self) -> String {
        if self.in_think_block {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

/// Byte index that leaves at most `keep` bytes after it, moved back to a
/// char boundary.
fn split_keeping_suffix(s: &str, keep: usize) -> usize {
    let mut idx = s.len().saturating_sub(keep);
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Find the position of a sentence-ending character (`.`, `!`, `?`, `\n`).
///
/// Returns the byte index of the boundary character, or `None` if no
/// boundary is found.
pub fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            // Not a decimal point or an abbreviation mid-word.
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Split `text` into speakable sentence-sized segments, trimmed and
/// non-empty. The last segment may lack terminal punctuation.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut rest = text;
    while let Some(pos) = find_sentence_boundary(rest) {
        let sentence = rest[..=pos].trim();
        if !sentence.is_empty() {
            segments.push(sentence.to_owned());
        }
        rest = &rest[pos + 1..];
    }
    let tail = rest.trim();
    if !tail.is_empty() {
        segments.push(tail.to_owned());
    }
    segments
}
