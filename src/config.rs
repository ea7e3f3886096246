use std::collections::HashMap;
use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::collaborators::{GuardConfig, ProviderConfig};
use crate::rate_limit::{RateLimitConfig, DEFAULT_SWEEP_INTERVAL_MS};

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Upper bound for `CHAT_RATE_WINDOW_MS`: one day.
pub const MAX_RATE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub guard: GuardConfig,
    pub chat_rate: RateLimitConfig,
    pub sweep_interval_ms: i64,
    pub max_request_bytes: Option<usize>,
    /// Bearer token → user id.
    pub api_tokens: HashMap<String, String>,
    pub user_records_file: Option<String>,
    pub provider: ProviderConfig,
    pub log_file: Option<String>,
    pub log_stdout: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let guard = if let Ok(path) = env::var("CHAT_GUARD_CONFIG") {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read CHAT_GUARD_CONFIG '{}': file unreadable", path))?;
            serde_json::from_str::<GuardConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse CHAT_GUARD_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            GuardConfig::default()
        };

        let defaults = RateLimitConfig::CHAT;
        let limit = match parse_optional_u64("CHAT_RATE_LIMIT")? {
            Some(0) => return Err(anyhow!("CHAT_RATE_LIMIT must be greater than zero")),
            Some(v) => u32::try_from(v).map_err(|_| anyhow!("CHAT_RATE_LIMIT is too large"))?,
            None => defaults.limit,
        };
        let window_ms = positive_ms("CHAT_RATE_WINDOW_MS")?.unwrap_or(defaults.window_duration_ms);
        if window_ms > MAX_RATE_WINDOW_MS {
            return Err(anyhow!(
                "CHAT_RATE_WINDOW_MS must be at most {} (one day)",
                MAX_RATE_WINDOW_MS
            ));
        }
        let sweep_interval_ms =
            positive_ms("RATE_LIMIT_SWEEP_INTERVAL_MS")?.unwrap_or(DEFAULT_SWEEP_INTERVAL_MS);

        let max_request_bytes = parse_optional_u64("CHAT_MAX_REQUEST_BYTES")?
            .map(|v| v as usize)
            .or(Some(DEFAULT_MAX_REQUEST_BYTES))
            .filter(|v| *v > 0);

        let api_tokens = match env::var("CHAT_API_TOKENS") {
            Ok(raw) => parse_token_map(&raw)?,
            Err(_) => HashMap::new(),
        };

        let mut provider = ProviderConfig::default();
        if let Some(url) = non_empty_var("LLM_BASE_URL") {
            provider.base_url = url;
        }
        provider.api_key = non_empty_var("LLM_API_KEY");
        if let Some(model) = non_empty_var("LLM_MODEL") {
            provider.model = model;
        }
        if let Some(max) = parse_optional_u64("LLM_MAX_TOKENS")? {
            provider.max_tokens = u32::try_from(max).map_err(|_| anyhow!("LLM_MAX_TOKENS is too large"))?;
        }
        if let Some(secs) = parse_optional_u64("LLM_REQUEST_TIMEOUT_SECS")? {
            provider.request_timeout_secs = secs;
        }
        if let Some(secs) = parse_optional_u64("LLM_CONNECT_TIMEOUT_SECS")? {
            provider.connect_timeout_secs = secs;
        }

        Ok(Self {
            guard,
            chat_rate: RateLimitConfig::new(limit, window_ms),
            sweep_interval_ms,
            max_request_bytes,
            api_tokens,
            user_records_file: non_empty_var("USER_RECORDS_FILE"),
            provider,
            log_file: env::var("LOG_FILE").ok(),
            log_stdout: parse_bool_env("CHAT_LOG_STDOUT")?.unwrap_or(false),
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive_ms(var: &str) -> Result<Option<i64>> {
    match parse_optional_u64(var)? {
        Some(0) => Err(anyhow!("{} must be greater than zero", var)),
        Some(v) => i64::try_from(v)
            .map(Some)
            .map_err(|_| anyhow!("{} is too large", var)),
        None => Ok(None),
    }
}

/// Parse `token:user,token2:user2`. Blank entries are skipped.
fn parse_token_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (token, user) = entry
            .split_once(':')
            .map(|(t, u)| (t.trim(), u.trim()))
            .filter(|(t, u)| !t.is_empty() && !u.is_empty())
            .ok_or_else(|| anyhow!("CHAT_API_TOKENS entries must look like token:user_id"))?;
        tokens.insert(token.to_string(), user.to_string());
    }
    Ok(tokens)
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
