//! OpenAI-compatible streaming chat completions.
//!
//! The adapter posts `stream: true` requests to `/chat/completions` and
//! decodes the server-sent events into [`StreamChunk`]s. Decoding is pure
//! (`SseDecoder`, `parse_sse_data`) so it can be tested without a network.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChatMessage, ChunkReceiver, CompletionProvider, StreamChunk, PROVIDER_CHANNEL_CAPACITY};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Errors produced while talking to the model provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request failed or the connection dropped mid-stream.
    #[error("provider request failed: {0}")]
    Request(String),

    /// The provider answered with a non-success status.
    #[error("provider response error: status {status}")]
    Status { status: u16, body: String },

    /// An event payload could not be decoded.
    #[error("provider stream parse failed: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

pub struct OpenAiStreamProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiStreamProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ProviderError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn request(&self, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            stream: true,
        };
        let rb = self
            .http
            .post(url)
            .header("accept", "text/event-stream")
            .json(&body);
        match &self.config.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }
}

impl CompletionProvider for OpenAiStreamProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn stream_completion(&self, messages: Vec<ChatMessage>) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);
        let request = self.request(&messages);
        tokio::spawn(produce(request, tx));
        rx
    }
}

type ChunkSender = mpsc::Sender<Result<StreamChunk, ProviderError>>;

/// Drive one provider request, forwarding decoded chunks until the stream
/// ends, a final chunk is sent, or the consumer goes away. Returning drops
/// the response, which releases the connection.
async fn produce(request: reqwest::RequestBuilder, tx: ChunkSender) {
    let response = tokio::select! {
        _ = tx.closed() => {
            tracing::debug!("consumer closed before provider responded");
            return;
        }
        res = request.send() => res,
    };
    let response = match response {
        Ok(r) => r,
        Err(err) => {
            let _ = tx.send(Err(ProviderError::Request(err.to_string()))).await;
            return;
        }
    };
    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        let _ = tx.send(Err(ProviderError::Status { status, body })).await;
        return;
    }

    let mut body = Box::pin(response.bytes_stream());
    let mut decoder = SseDecoder::default();
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("consumer closed mid-stream, dropping provider connection");
                return;
            }
            next = body.next() => next,
        };
        let lines = match next {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(err)) => {
                let _ = tx.send(Err(ProviderError::Request(err.to_string()))).await;
                return;
            }
            None => decoder.finish(),
        };
        for data in lines {
            match parse_sse_data(&data) {
                Ok(Some(chunk)) => {
                    let is_final = chunk.is_final;
                    if tx.send(Ok(chunk)).await.is_err() || is_final {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
        if decoder.is_finished() {
            return;
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

/// Incremental splitter for `text/event-stream` bodies. Yields the payload
/// of each `data:` line; comments, event names and blank lines are skipped.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = memchr::memchr(b'\n', &self.buf) {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = Self::data_of(&line) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing line without newline and mark the stream as ended.
    pub fn finish(&mut self) -> Vec<String> {
        self.finished = true;
        let rest = std::mem::take(&mut self.buf);
        Self::data_of(&rest).into_iter().collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn data_of(line: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(&['\r', '\n'][..]);
        let data = text.strip_prefix("data:")?;
        Some(data.strip_prefix(' ').unwrap_or(data).to_string())
    }
}

/// Decode one `data:` payload. `[DONE]` becomes an empty final chunk; events
/// without content or finish reason yield `None`.
pub fn parse_sse_data(data: &str) -> Result<Option<StreamChunk>, ProviderError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(StreamChunk::last("")));
    }
    let event: Value = serde_json::from_str(data).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if let Some(err) = event.get("error") {
        return Err(ProviderError::Request(err.to_string()));
    }
    let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else {
        return Ok(None);
    };
    let content = choice
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .unwrap_or("");
    let finished = choice
        .get("finish_reason")
        .map(|f| !f.is_null())
        .unwrap_or(false);
    if content.is_empty() && !finished {
        return Ok(None);
    }
    Ok(Some(StreamChunk {
        content: content.to_string(),
        is_final: finished,
    }))
}
