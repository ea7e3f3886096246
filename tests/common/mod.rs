#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request};
use chat_guard::collaborators::{
    BoundedContextBuilder, ChatMessage, ChunkReceiver, CompletionProvider, Identity, IdentityResolver,
    InMemoryRecordStore, PatternSanitizer, ProviderError, RecordsError, StreamChunk, UserRecordStore,
    UserRecords, PROVIDER_CHANNEL_CAPACITY,
};
use chat_guard::{AppState, ChatComponents};
use tokio::sync::mpsc;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Replays a fixed list of items, then closes the stream.
pub struct ScriptedProvider {
    script: Vec<Result<StreamChunk, ProviderError>>,
    pub calls: Arc<AtomicUsize>,
    pub last_messages: Arc<std::sync::Mutex<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<StreamChunk, ProviderError>>) -> Self {
        Self {
            script,
            calls: Arc::new(AtomicUsize::new(0)),
            last_messages: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn answering(parts: &[&str]) -> Self {
        let mut script: Vec<_> = parts.iter().map(|p| Ok(StreamChunk::delta(*p))).collect();
        script.push(Ok(StreamChunk::last("")));
        Self::new(script)
    }
}

impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream_completion(&self, messages: Vec<ChatMessage>) -> ChunkReceiver {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages;
        let (tx, rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);
        let script = self.script.clone();
        tokio::spawn(async move {
            for item in script {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// Emits chunks until the consumer goes away, then raises `stopped`.
pub struct EndlessProvider {
    pub sent: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicBool>,
}

impl EndlessProvider {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(AtomicUsize::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CompletionProvider for EndlessProvider {
    fn name(&self) -> &str {
        "endless"
    }

    fn stream_completion(&self, _messages: Vec<ChatMessage>) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(PROVIDER_CHANNEL_CAPACITY);
        let sent = self.sent.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    res = tx.send(Ok(StreamChunk::delta("token "))) => {
                        if res.is_err() {
                            break;
                        }
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopped.store(true, Ordering::SeqCst);
        });
        rx
    }
}

pub struct StaticIdentity(pub Option<&'static str>);

#[async_trait::async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self, _headers: &HeaderMap) -> Option<Identity> {
        self.0.map(|id| Identity { id: id.to_string() })
    }
}

pub struct FailingRecords;

#[async_trait::async_trait]
impl UserRecordStore for FailingRecords {
    async fn fetch(&self, _user_id: &str) -> Result<UserRecords, RecordsError> {
        Err(RecordsError::Unavailable("connection refused".into()))
    }
}

pub fn components(provider: Arc<dyn CompletionProvider>) -> ChatComponents {
    ChatComponents {
        sanitizer: Arc::new(PatternSanitizer::default()),
        identity: Arc::new(StaticIdentity(Some("user-1"))),
        records: Arc::new(InMemoryRecordStore::default()),
        context: Arc::new(BoundedContextBuilder::default()),
        provider,
    }
}

pub fn test_state(provider: Arc<dyn CompletionProvider>) -> AppState {
    AppState::new(components(provider))
}

pub fn chat_request(message: &str) -> Request<Body> {
    chat_request_from(message, "198.51.100.10")
}

pub fn chat_request_from(message: &str, ip: &str) -> Request<Body> {
    let body = serde_json::json!({ "message": message }).to_string();
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_string(body: Body) -> String {
    use http_body_util::BodyExt;
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
