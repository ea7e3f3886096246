use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Datelike, Utc};

use super::{ChatMessage, ContextBuilder, UserRecords};
use crate::util::truncate_chars;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Você é um assistente de carreira. Ajude a pessoa usuária a acompanhar \
suas candidaturas, preparar entrevistas, avaliar propostas e entender suas métricas de busca de emprego. \
Responda em português, de forma objetiva, usando apenas os dados fornecidos no contexto quando falar \
de números. Recuse educadamente assuntos que não tenham relação com carreira.";

/// Builds `[system prompt, data summary, user message]`, bounding the summary
/// by record count and character length.
#[derive(Clone, Debug)]
pub struct BoundedContextBuilder {
    system_prompt: String,
    max_records: usize,
    max_context_chars: usize,
}

impl BoundedContextBuilder {
    pub fn new(system_prompt: Option<String>, max_records: usize, max_context_chars: usize) -> Self {
        Self {
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_records,
            max_context_chars,
        }
    }

    pub fn build_at(&self, sanitized_text: &str, records: &UserRecords, now: DateTime<Utc>) -> Vec<ChatMessage> {
        let summary = self.summarize(records, now);
        vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::system(truncate_chars(&summary, self.max_context_chars).to_string()),
            ChatMessage::user(sanitized_text),
        ]
    }

    fn summarize(&self, records: &UserRecords, now: DateTime<Utc>) -> String {
        let mut out = String::from("Dados da pessoa usuária:\n");
        if let Some(profile) = &records.profile {
            if let Some(name) = &profile.name {
                let _ = writeln!(out, "- Nome: {name}");
            }
            if let Some(headline) = &profile.headline {
                let _ = writeln!(out, "- Resumo: {headline}");
            }
            if let Some(role) = &profile.target_role {
                let _ = writeln!(out, "- Cargo desejado: {role}");
            }
        }

        let apps = &records.applications;
        let this_month = apps
            .iter()
            .filter(|a| a.applied_at.year() == now.year() && a.applied_at.month() == now.month())
            .count();
        let _ = writeln!(out, "- Total de candidaturas: {}", apps.len());
        let _ = writeln!(out, "- Candidaturas neste mês: {this_month}");

        let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
        for app in apps {
            *by_status.entry(app.status.as_str()).or_default() += 1;
        }
        if !by_status.is_empty() {
            let parts: Vec<String> = by_status.iter().map(|(s, n)| format!("{s}: {n}")).collect();
            let _ = writeln!(out, "- Por status: {}", parts.join(", "));
        }

        let mut recent: Vec<_> = apps.iter().collect();
        recent.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        if !recent.is_empty() {
            out.push_str("Candidaturas recentes:\n");
        }
        for app in recent.into_iter().take(self.max_records) {
            let _ = writeln!(
                out,
                "- {} | {} | {} | {}",
                app.applied_at.format("%Y-%m-%d"),
                app.company,
                app.role,
                app.status
            );
        }
        out
    }
}

impl Default for BoundedContextBuilder {
    fn default() -> Self {
        Self::new(None, 20, 6000)
    }
}

impl ContextBuilder for BoundedContextBuilder {
    fn build(&self, sanitized_text: &str, records: &UserRecords) -> Vec<ChatMessage> {
        self.build_at(sanitized_text, records, Utc::now())
    }
}
