use once_cell::sync::Lazy;
use regex::Regex;

use super::{SanitizeOutcome, Sanitizer};
use crate::util::ac_for;

/// Longest run of one repeated character accepted in a message.
const MAX_CHAR_RUN: usize = 64;

// Prompt-injection and markup patterns, English and Portuguese. Matched
// against the cleaned, lower-cased message.
static INJECTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "ignore_instructions",
            r"ignor(e|ar|a)\s+(all\s+|todas?\s+)?(as\s+|os\s+)?(previous|prior|above|anteriores|instru[cç][oõ]es|regras)",
        ),
        ("ignore_instructions", r"ignore\s+(all\s+)?(previous|prior|above)\s+instructions"),
        ("disregard_rules", r"(disregard|desconsidere|esque[cç]a)\s+(all\s+|todas?\s+)?(the\s+|as\s+|suas\s+)?(rules|instructions|regras|instru[cç][oõ]es)"),
        ("system_prompt", r"(system\s+prompt|prompt\s+do\s+sistema|suas\s+instru[cç][oõ]es\s+iniciais)"),
        ("role_override", r"(you\s+are\s+now|voc[eê]\s+agora\s+[eé]|a\s+partir\s+de\s+agora\s+voc[eê]\s+[eé]|act\s+as\s+(a|an)\b|finja\s+(ser|que))"),
        ("jailbreak", r"\b(jailbreak|dan\s+mode|developer\s+mode|modo\s+desenvolvedor)\b"),
        ("role_tags", r"(<\|?(im_start|im_end|system|assistant)\|?>|\[/?inst\]|^\s*(system|assistant)\s*:)"),
        ("markup", r"<\s*(script|iframe|object|embed)\b"),
    ]
    .into_iter()
    .map(|(name, pat)| (name, Regex::new(&format!("(?im){pat}")).expect("built-in injection pattern must compile")))
    .collect()
});

static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank line pattern"));

/// Default [`Sanitizer`]: control-character cleanup, size limits, flooding
/// and prompt-injection detection, plus operator-configured phrases.
#[derive(Clone, Debug)]
pub struct PatternSanitizer {
    max_message_chars: usize,
    blocked_phrases: Vec<String>,
}

impl PatternSanitizer {
    pub fn new(max_message_chars: usize, blocked_phrases: Vec<String>) -> Self {
        Self {
            max_message_chars,
            blocked_phrases,
        }
    }

    fn clean(raw: &str) -> String {
        let stripped: String = raw
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        BLANK_LINES_RE
            .replace_all(&stripped, "\n\n")
            .trim()
            .to_string()
    }

    fn longest_run(text: &str) -> usize {
        let mut longest = 0;
        let mut current = 0;
        let mut prev = None;
        for c in text.chars() {
            if Some(c) == prev && !c.is_whitespace() {
                current += 1;
            } else {
                current = 1;
                prev = Some(c);
            }
            longest = longest.max(current);
        }
        longest
    }
}

impl Default for PatternSanitizer {
    fn default() -> Self {
        Self::new(2000, Vec::new())
    }
}

impl Sanitizer for PatternSanitizer {
    fn validate(&self, raw: &str) -> SanitizeOutcome {
        if memchr::memchr(0, raw.as_bytes()).is_some() {
            return SanitizeOutcome::reject("Mensagem contém conteúdo binário.");
        }
        let cleaned = Self::clean(raw);
        if cleaned.is_empty() {
            return SanitizeOutcome::reject("Mensagem vazia.");
        }
        let chars = cleaned.chars().count();
        if chars > self.max_message_chars {
            return SanitizeOutcome::reject(format!(
                "Mensagem muito longa ({chars} caracteres, máximo {}).",
                self.max_message_chars
            ));
        }
        if Self::longest_run(&cleaned) > MAX_CHAR_RUN {
            return SanitizeOutcome::reject("Mensagem contém repetição excessiva.");
        }
        let lower = cleaned.to_lowercase();
        if let Some((name, _)) = INJECTION_PATTERNS.iter().find(|(_, re)| re.is_match(&lower)) {
            tracing::debug!(pattern = name, "sanitizer matched injection pattern");
            return SanitizeOutcome::reject("Mensagem contém instruções não permitidas.");
        }
        if let Some(ac) = ac_for(&self.blocked_phrases) {
            if ac.is_match(&lower) {
                return SanitizeOutcome::reject("Mensagem contém termos não permitidos.");
            }
        }
        SanitizeOutcome::accept(cleaned)
    }
}
