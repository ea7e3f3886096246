//! The `/chat` pipeline: admission, sanitization, topic screening and the
//! chunk-by-chunk relay of the model's answer.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{stream, Stream};
use serde_json::{json, Value};

use crate::collaborators::ChunkReceiver;
use crate::rate_limit::{self, RateLimitDecision};
use crate::telemetry::{DecisionEvent, Metrics, TelemetrySink};
use crate::AppState;

/// Namespace prefix for chat rate-limit keys.
pub const CHAT_KEY_PREFIX: &str = "chat:";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Admitting,
    Sanitizing,
    Classifying,
    Streaming,
    Closed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Admitting => "admitting",
            Stage::Sanitizing => "sanitizing",
            Stage::Classifying => "classifying",
            Stage::Streaming => "streaming",
            Stage::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a chat request can end without a stream.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("rate limit exceeded")]
    RateLimited {
        decision: RateLimitDecision,
        retry_after_secs: u64,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request body exceeds {limit:?} bytes")]
    PayloadTooLarge { limit: Option<usize> },

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal failure while {stage}: {detail}")]
    Internal { stage: Stage, detail: String },
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match self {
            ChatError::RateLimited {
                decision,
                retry_after_secs,
            } => {
                let body = Json(json!({
                    "error": "Muitas requisições. Tente novamente em instantes.",
                    "retryAfter": retry_after_secs,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                let headers = response.headers_mut();
                insert_rate_headers(headers, &decision);
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            ChatError::InvalidInput(reason) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": reason, "blocked": true })),
            )
                .into_response(),
            ChatError::PayloadTooLarge { limit } => {
                let message = match limit {
                    Some(limit) => format!("Request too large (body exceeded limit {limit} bytes)"),
                    None => "Request too large".to_string(),
                };
                (StatusCode::PAYLOAD_TOO_LARGE, message).into_response()
            }
            ChatError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            ChatError::Internal { stage, detail } => {
                tracing::error!(stage = %stage, error = %detail, "chat request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

pub fn insert_rate_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_unix_secs()));
}

/// Rate-limit key for a caller: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let ip = match forwarded.or_else(real_ip) {
        Some(ip) => ip.to_string(),
        None => peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };
    format!("{CHAT_KEY_PREFIX}{ip}")
}

/// Run one chat request through every stage. Returns the response to send;
/// the error side carries the non-streaming terminal outcomes.
pub async fn run_chat(
    state: &AppState,
    key: &str,
    headers: &HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ChatError> {
    // Admitting
    let decision = state.limiter.check(key, &state.chat_rate);
    if !decision.allowed {
        let retry_after_secs = decision.retry_after_secs(rate_limit::now_ms());
        Metrics::incr(&state.metrics.rate_limited_total);
        state.telemetry.emit(
            DecisionEvent::RateLimited,
            key,
            json!({ "limit": decision.limit, "retryAfter": retry_after_secs }),
        );
        return Err(ChatError::RateLimited {
            decision,
            retry_after_secs,
        });
    }

    // Sanitizing
    let raw = extract_message(state, payload)?;
    let outcome = state.sanitizer.validate(&raw);
    if !outcome.valid {
        let reason = outcome
            .reason
            .unwrap_or_else(|| "Mensagem inválida.".to_string());
        Metrics::incr(&state.metrics.input_blocked_total);
        state
            .telemetry
            .emit(DecisionEvent::InputBlocked, key, json!({ "reason": reason }));
        return Err(ChatError::InvalidInput(reason));
    }
    let text = outcome.sanitized_text;

    // Classifying
    let classification = state.topic.classify(&text);
    if !classification.on_topic {
        Metrics::incr(&state.metrics.off_topic_total);
        state.telemetry.emit(
            DecisionEvent::OffTopic,
            key,
            json!({ "rule": classification.matched_rule, "confidence": classification.confidence.as_str() }),
        );
        let reply = classification.suggested_reply.unwrap_or_default();
        let mut response = Json(json!({
            "message": reply,
            "blocked": true,
            "reason": "off_topic",
        }))
        .into_response();
        insert_rate_headers(response.headers_mut(), &decision);
        return Ok(response);
    }
    if classification.is_low_confidence_ambiguous() {
        Metrics::incr(&state.metrics.ambiguous_total);
        state.telemetry.emit(
            DecisionEvent::Ambiguous,
            key,
            json!({ "chars": text.chars().count() }),
        );
    }
    tracing::debug!(
        stage = %Stage::Classifying,
        category = classification.category.as_str(),
        confidence = classification.confidence.as_str(),
        "message admitted"
    );

    // Streaming
    let identity = state
        .identity
        .resolve(headers)
        .await
        .ok_or(ChatError::Unauthorized)?;
    let records = state
        .records
        .fetch(&identity.id)
        .await
        .map_err(|e| ChatError::Internal {
            stage: Stage::Streaming,
            detail: e.to_string(),
        })?;
    let messages = state.context.build(&text, &records);
    let rx = state.provider.stream_completion(messages);
    Metrics::incr(&state.metrics.streams_started_total);
    tracing::info!(
        stage = %Stage::Streaming,
        provider = state.provider.name(),
        user_id = %identity.id,
        "stream opened"
    );

    let guard = RelayGuard::new(
        state.metrics.clone(),
        state.telemetry.clone(),
        key.to_string(),
        identity.id,
    );
    let mut response = Response::new(Body::from_stream(relay_stream(rx, guard)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    insert_rate_headers(headers, &decision);
    Ok(response)
}

fn extract_message(
    state: &AppState,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<String, ChatError> {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        ))) => {
            tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
            return Err(ChatError::PayloadTooLarge {
                limit: state.max_request_bytes,
            });
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "rejected chat body");
            return Err(ChatError::InvalidInput("Corpo da requisição inválido.".into()));
        }
    };
    match body.get("message").and_then(Value::as_str) {
        Some(message) => Ok(message.to_string()),
        None => Err(ChatError::InvalidInput(
            "O campo 'message' é obrigatório.".into(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Failed => "failed",
            StreamOutcome::Cancelled => "cancelled",
        }
    }
}

/// Owns the bookkeeping for one relayed stream. Dropped exactly once, on
/// whichever path ends the body; an unset outcome means the caller left.
pub struct RelayGuard {
    metrics: Arc<Metrics>,
    telemetry: TelemetrySink,
    client_key: String,
    user_id: String,
    started: Instant,
    chunks: u64,
    outcome: Option<StreamOutcome>,
}

impl RelayGuard {
    pub fn new(metrics: Arc<Metrics>, telemetry: TelemetrySink, client_key: String, user_id: String) -> Self {
        Self {
            metrics,
            telemetry,
            client_key,
            user_id,
            started: Instant::now(),
            chunks: 0,
            outcome: None,
        }
    }

    fn relayed(&mut self) {
        self.chunks += 1;
        Metrics::incr(&self.metrics.chunks_relayed_total);
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        self.outcome.get_or_insert(outcome);
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(StreamOutcome::Cancelled);
        let counter = match outcome {
            StreamOutcome::Completed => &self.metrics.streams_completed_total,
            StreamOutcome::Failed => &self.metrics.streams_failed_total,
            StreamOutcome::Cancelled => &self.metrics.streams_cancelled_total,
        };
        Metrics::incr(counter);
        let duration_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(
            stage = %Stage::Closed,
            outcome = outcome.as_str(),
            chunks = self.chunks,
            duration_ms,
            "stream closed"
        );
        self.telemetry.emit(
            DecisionEvent::StreamClosed,
            &self.client_key,
            json!({
                "userId": self.user_id,
                "outcome": outcome.as_str(),
                "chunks": self.chunks,
                "durationMs": duration_ms,
            }),
        );
    }
}

/// Turn the provider channel into a response body. Empty chunks are
/// skipped, the body ends after a final chunk or when the provider stream
/// ends, and a provider error ends it early without an error payload.
/// Dropping the returned stream drops the receiver, which stops the producer.
pub fn relay_stream(
    rx: ChunkReceiver,
    guard: RelayGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream::unfold(Some((rx, guard)), |state| async move {
        let (mut rx, mut guard) = state?;
        loop {
            match rx.recv().await {
                Some(Ok(chunk)) if chunk.is_final => {
                    guard.finish(StreamOutcome::Completed);
                    if chunk.content.is_empty() {
                        return None;
                    }
                    guard.relayed();
                    return Some((Ok::<_, Infallible>(Bytes::from(chunk.content)), None));
                }
                Some(Ok(chunk)) => {
                    if chunk.content.is_empty() {
                        continue;
                    }
                    guard.relayed();
                    return Some((Ok(Bytes::from(chunk.content)), Some((rx, guard))));
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, chunks = guard.chunks, "provider stream failed, truncating response");
                    guard.finish(StreamOutcome::Failed);
                    return None;
                }
                None => {
                    guard.finish(StreamOutcome::Completed);
                    return None;
                }
            }
        }
    })
}
