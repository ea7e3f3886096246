//! Small shared helpers: cached literal matchers and text trimming.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Matchers keyed by a hash of their pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Return a shared, ASCII case-insensitive matcher for `list`, building it on
/// first use. Returns `None` for an empty list or if the automaton cannot be
/// built.
pub fn ac_for(list: &[String]) -> Option<Arc<AhoCorasick>> {
    if list.is_empty() {
        return None;
    }
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return Some(existing.clone());
    }
    let lower: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
    match AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
    {
        Ok(ac) => {
            let arc = Arc::new(ac);
            AC_CACHE.insert(key, arc.clone());
            Some(arc)
        }
        Err(err) => {
            tracing::warn!(error = %err, patterns = list.len(), "failed to build phrase matcher");
            None
        }
    }
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
