//! Contracts for the services the chat pipeline consumes but does not own.
//!
//! Each seam is a trait so the HTTP layer can be exercised with in-memory
//! doubles. Default implementations live in the submodules and are wired by
//! `build_state_from_env`.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod context;
pub mod identity;
pub mod provider;
pub mod records;
pub mod sanitizer;

pub use self::context::BoundedContextBuilder;
pub use self::identity::BearerTokenIdentity;
pub use self::provider::{OpenAiStreamProvider, ProviderConfig, ProviderError};
pub use self::records::{ApplicationRecord, InMemoryRecordStore, RecordsError, UserProfile, UserRecords};
pub use self::sanitizer::PatternSanitizer;

/// Operator-tunable settings loaded from `CHAT_GUARD_CONFIG`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardConfig {
    /// Regexes appended after the built-in topic blocklist.
    #[serde(default)]
    pub extra_blocklist: Vec<String>,
    /// Replacement deflection messages; empty keeps the built-in set.
    #[serde(default)]
    pub deflections: Vec<String>,
    /// Literal phrases the sanitizer rejects, case-insensitive.
    #[serde(default)]
    pub blocked_phrases: Vec<String>,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

fn default_max_message_chars() -> usize {
    2000
}

fn default_max_records() -> usize {
    20
}

fn default_max_context_chars() -> usize {
    6000
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            extra_blocklist: Vec::new(),
            deflections: Vec::new(),
            blocked_phrases: Vec::new(),
            max_message_chars: default_max_message_chars(),
            system_prompt: None,
            max_records: default_max_records(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

/// Result of input sanitization. `sanitized_text` is only meaningful when
/// `valid` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeOutcome {
    pub valid: bool,
    pub sanitized_text: String,
    pub reason: Option<String>,
}

impl SanitizeOutcome {
    pub fn accept(text: String) -> Self {
        Self {
            valid: true,
            sanitized_text: text,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            sanitized_text: String::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Injection and abuse screening applied before topic classification.
pub trait Sanitizer: Send + Sync {
    fn validate(&self, raw: &str) -> SanitizeOutcome;
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
}

#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Return the caller, or `None` when the request is not authenticated.
    async fn resolve(&self, headers: &HeaderMap) -> Option<Identity>;
}

#[async_trait::async_trait]
pub trait UserRecordStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<UserRecords, RecordsError>;
}

/// A single provider-neutral chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

pub trait ContextBuilder: Send + Sync {
    /// Produce the ordered, size-bounded message list for one request.
    fn build(&self, sanitized_text: &str, records: &UserRecords) -> Vec<ChatMessage>;
}

/// One piece of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: String,
    pub is_final: bool,
}

impl StreamChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
        }
    }

    pub fn last(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: true,
        }
    }
}

/// Consumer side of a provider stream. Dropping it tells the producer to stop.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// Chunks buffered between provider and relay: one in flight, no read-ahead.
pub const PROVIDER_CHANNEL_CAPACITY: usize = 1;

pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start producing chunks for `messages`. The request runs on a spawned
    /// task; the stream is finite and cannot be restarted.
    fn stream_completion(&self, messages: Vec<ChatMessage>) -> ChunkReceiver;
}
