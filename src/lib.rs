//! Core library for the guarded chat endpoint. This module wires the rate
//! limiter, sanitizer, topic guard and model provider into the HTTP
//! handlers, and exposes health and metrics endpoints.

mod config;
pub mod collaborators;
pub mod rate_limit;
pub mod relay;
pub mod telemetry;
pub mod topic;
pub mod util;

pub use config::{AppConfig, DEFAULT_MAX_REQUEST_BYTES};

use std::any::Any;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::collaborators::{
    BearerTokenIdentity, BoundedContextBuilder, CompletionProvider, ContextBuilder, IdentityResolver,
    InMemoryRecordStore, OpenAiStreamProvider, PatternSanitizer, Sanitizer, UserRecordStore,
};
use crate::rate_limit::{RateLimitConfig, RateLimitStore, RateLimiter};
use crate::relay::ChatError;
use crate::telemetry::{Metrics, TelemetrySink};
use crate::topic::TopicGuard;

/// The services a chat request depends on. Swapped for doubles in tests.
pub struct ChatComponents {
    pub sanitizer: Arc<dyn Sanitizer>,
    pub identity: Arc<dyn IdentityResolver>,
    pub records: Arc<dyn UserRecordStore>,
    pub context: Arc<dyn ContextBuilder>,
    pub provider: Arc<dyn CompletionProvider>,
}

/// Shared application state. Cloned per request; everything mutable sits
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiter,
    pub chat_rate: RateLimitConfig,
    pub topic: TopicGuard,
    pub sanitizer: Arc<dyn Sanitizer>,
    pub identity: Arc<dyn IdentityResolver>,
    pub records: Arc<dyn UserRecordStore>,
    pub context: Arc<dyn ContextBuilder>,
    pub provider: Arc<dyn CompletionProvider>,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
    /// Maximum accepted request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// State with default limiter, topic guard and body limit, and telemetry
    /// disabled.
    pub fn new(components: ChatComponents) -> Self {
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            limiter: RateLimiter::new(Arc::new(RateLimitStore::default())),
            chat_rate: RateLimitConfig::CHAT,
            topic: TopicGuard::default(),
            sanitizer: components.sanitizer,
            identity: components.identity,
            records: components.records,
            context: components.context,
            provider: components.provider,
            telemetry: TelemetrySink::default(),
            metrics: Arc::new(Metrics::default()),
            max_request_bytes: Some(DEFAULT_MAX_REQUEST_BYTES),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn with_rate_limit(mut self, limiter: RateLimiter, chat_rate: RateLimitConfig) -> Self {
        self.limiter = limiter;
        self.chat_rate = chat_rate;
        self
    }

    pub fn with_topic_guard(mut self, topic: TopicGuard) -> Self {
        self.topic = topic;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: Option<usize>) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }
}

/// Build state from environment variables. See [`AppConfig::from_env`] for
/// the variables read. Missing credentials or data files are warned about
/// rather than treated as fatal.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    let AppConfig {
        guard,
        chat_rate,
        sweep_interval_ms,
        max_request_bytes,
        api_tokens,
        user_records_file,
        provider,
        log_file,
        log_stdout,
    } = config;

    if api_tokens.is_empty() {
        tracing::warn!("CHAT_API_TOKENS not set: every streaming request will be rejected with 401");
    }
    let records = match user_records_file.as_deref() {
        Some(path) => {
            let store = InMemoryRecordStore::from_file(path)?;
            tracing::info!(path = %path, users = store.len(), "loaded user records");
            store
        }
        None => {
            tracing::warn!("USER_RECORDS_FILE not set: context will contain no user data");
            InMemoryRecordStore::default()
        }
    };
    if provider.api_key.is_none() {
        tracing::warn!(base_url = %provider.base_url, "LLM_API_KEY not set; requests go out unauthenticated");
    }

    let components = ChatComponents {
        sanitizer: Arc::new(PatternSanitizer::new(
            guard.max_message_chars,
            guard.blocked_phrases.clone(),
        )),
        identity: Arc::new(BearerTokenIdentity::new(api_tokens)),
        records: Arc::new(records),
        context: Arc::new(BoundedContextBuilder::new(
            guard.system_prompt.clone(),
            guard.max_records,
            guard.max_context_chars,
        )),
        provider: Arc::new(OpenAiStreamProvider::new(provider)?),
    };
    let topic = TopicGuard::default()
        .with_extra_blocklist(&guard.extra_blocklist)
        .with_deflections(&guard.deflections);
    let limiter = RateLimiter::new(Arc::new(RateLimitStore::new(sweep_interval_ms)));

    Ok(AppState::new(components)
        .with_rate_limit(limiter, chat_rate)
        .with_topic_guard(topic)
        .with_telemetry(TelemetrySink::open(log_file.as_deref(), log_stdout))
        .with_max_request_bytes(max_request_bytes))
}

/// Build the Axum router and attach handlers. The router holds a copy
/// of the `AppState` for each invocation.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/chat", post(chat_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Handler for `POST /chat`.
async fn chat_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    Metrics::incr(&state.metrics.requests_total);
    let key = relay::client_key(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    match relay::run_chat(&state, &key, &headers, payload).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ChatError::Unauthorized => Metrics::incr(&state.metrics.unauthorized_total),
                ChatError::Internal { .. } => Metrics::incr(&state.metrics.internal_errors_total),
                _ => {}
            }
            err.into_response()
        }
    }
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "trackedKeys": state.limiter.store().len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

fn write_family(buf: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(buf, "# HELP {name} {help}").ok();
    writeln!(buf, "# TYPE {name} {kind}").ok();
    writeln!(buf, "{name} {value}").ok();
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let m = &state.metrics;
    let mut buf = String::new();
    let counters = [
        ("chat_guard_requests_total", "Chat requests received", &m.requests_total),
        ("chat_guard_rate_limited_total", "Chat requests rejected by the rate limiter", &m.rate_limited_total),
        ("chat_guard_input_blocked_total", "Messages rejected by the input sanitizer", &m.input_blocked_total),
        ("chat_guard_off_topic_total", "Messages deflected as off-topic", &m.off_topic_total),
        ("chat_guard_ambiguous_total", "Low-confidence messages let through", &m.ambiguous_total),
        ("chat_guard_unauthorized_total", "Streaming requests without a resolvable identity", &m.unauthorized_total),
        ("chat_guard_internal_errors_total", "Requests that failed with an internal error", &m.internal_errors_total),
        ("chat_guard_streams_started_total", "Provider streams opened", &m.streams_started_total),
        ("chat_guard_streams_completed_total", "Streams that reached the end of the provider output", &m.streams_completed_total),
        ("chat_guard_streams_failed_total", "Streams truncated by a provider error", &m.streams_failed_total),
        ("chat_guard_streams_cancelled_total", "Streams abandoned by the caller", &m.streams_cancelled_total),
        ("chat_guard_chunks_relayed_total", "Non-empty chunks forwarded to callers", &m.chunks_relayed_total),
    ];
    for (name, help, counter) in counters {
        write_family(&mut buf, name, "counter", help, Metrics::get(counter));
    }
    write_family(
        &mut buf,
        "chat_guard_telemetry_lines_total",
        "counter",
        "Telemetry JSON lines written",
        state.telemetry.lines_total(),
    );
    write_family(
        &mut buf,
        "chat_guard_telemetry_write_errors_total",
        "counter",
        "Telemetry JSON line write failures",
        state.telemetry.write_errors_total(),
    );
    write_family(
        &mut buf,
        "chat_guard_rate_limit_tracked_keys",
        "gauge",
        "Keys currently held by the rate limiter",
        state.limiter.store().len(),
    );
    writeln!(
        &mut buf,
        "# HELP chat_guard_build_info Build information\n# TYPE chat_guard_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "chat_guard_build_info{{version=\"{}\",provider=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.provider.name()
    )
    .ok();
    write_family(
        &mut buf,
        "chat_guard_process_start_time_seconds",
        "gauge",
        "Process start time (Unix epoch seconds)",
        state.process_start_epoch,
    );
    write_family(
        &mut buf,
        "chat_guard_process_uptime_seconds",
        "gauge",
        "Process uptime seconds",
        state.process_start_instant.elapsed().as_secs_f64(),
    );
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
