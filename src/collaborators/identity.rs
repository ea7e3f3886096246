use std::collections::HashMap;

use axum::http::HeaderMap;

use super::{Identity, IdentityResolver};

/// Resolves callers from `Authorization: Bearer <token>` against a static
/// token → user id table.
#[derive(Clone, Debug, Default)]
pub struct BearerTokenIdentity {
    tokens: HashMap<String, String>,
}

impl BearerTokenIdentity {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Extract the bearer token from the `authorization` header, if well formed.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let scheme = raw.get(..6)?;
    let separated = raw.as_bytes().get(6).is_some_and(u8::is_ascii_whitespace);
    if !separated || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

#[async_trait::async_trait]
impl IdentityResolver for BearerTokenIdentity {
    async fn resolve(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = extract_bearer_token(headers)?;
        self.tokens.get(token).map(|id| Identity { id: id.clone() })
    }
}
