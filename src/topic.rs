//! Topic gating for the career assistant.
//!
//! Classification runs in three stages: a short-input short-circuit, an
//! ordered blocklist (first match wins) and an allowlist score. The guard only
//! blocks text that is clearly about something else; anything it cannot place
//! is let through as `ambiguous` so it can be logged.
//!
//! Pattern order is part of the contract. Reordering the blocklist changes
//! which deflection category is reported and, for overlapping patterns,
//! whether text is blocked at all.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Serialize;

/// Normalized inputs shorter than this many characters are never blocked.
pub const MIN_CLASSIFY_CHARS: usize = 10;

const MAX_EXTRA_PATTERNS: usize = 50;
const MAX_PATTERN_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicCategory {
    Career,
    OffTopic,
    Ambiguous,
}

impl TopicCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Career => "career",
            Self::OffTopic => "off_topic",
            Self::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicClassification {
    pub on_topic: bool,
    pub category: TopicCategory,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_reply: Option<String>,
    /// Name of the blocklist pattern that fired, for telemetry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<&'static str>,
    /// Number of allowlist patterns that matched.
    pub allow_matches: usize,
}

impl TopicClassification {
    fn ambiguous(allow_matches: usize) -> Self {
        Self {
            on_topic: true,
            category: TopicCategory::Ambiguous,
            confidence: Confidence::Low,
            suggested_reply: None,
            matched_rule: None,
            allow_matches,
        }
    }

    /// True when the request passes but should be logged as borderline.
    pub fn is_low_confidence_ambiguous(&self) -> bool {
        self.category == TopicCategory::Ambiguous && self.confidence == Confidence::Low
    }
}

struct TopicRule {
    name: &'static str,
    re: Regex,
    // Skipped when the text carries job-search vocabulary.
    yields_to_career: bool,
}

fn rule(name: &'static str, pattern: &str) -> TopicRule {
    TopicRule {
        name,
        re: Regex::new(&format!("(?i){pattern}")).expect("built-in topic pattern must compile"),
        yields_to_career: false,
    }
}

fn soft_rule(name: &'static str, pattern: &str) -> TopicRule {
    TopicRule {
        yields_to_career: true,
        ..rule(name, pattern)
    }
}

static CAREER_VOCABULARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(candidat(uras?|ei|ar|ou)|vagas?|entrevistas?|propostas?|recrutador(a|es)?|emprego|job|interviews?|offers?)\b",
    )
    .expect("career vocabulary pattern must compile")
});

// Evaluated in order against the normalized text; the first match blocks.
static BLOCKLIST: Lazy<Vec<TopicRule>> = Lazy::new(|| {
    vec![
        rule(
            "general_knowledge",
            r"\b(capital d[aeo]s?|presidente d[aeo]s?|quem (descobriu|inventou|pintou|escreveu)|em que ano (foi|aconteceu|come[cç]ou|acabou|nasceu|morreu|surgiu)|popula[cç][aã]o d[aeo]s?|what is the capital|who (invented|discovered|painted|wrote)|maior (pa[ií]s|rio|montanha|oceano))\b",
        ),
        rule(
            "entertainment",
            r"\b(filmes?|s[eé]ries?|novelas?|netflix|anime|futebol|campeonato|jogo d[aeo]|video ?games?|celebridades?|fofoca|movies?|tv shows?|football match|who won)\b",
        ),
        rule(
            "recipes",
            r"\b(receitas?|cozinhar|como fa[cç]o (um|uma) (bolo|torta|p[aã]o)|ingredientes|recipes?|how to cook|bake a)\b",
        ),
        rule(
            "arithmetic",
            r"(^[\d\s\.,]+[\+\-\*/x×÷^][\d\s\.,\+\-\*/x×÷^\(\)=]+\??$|\bquanto (é|e|da|dá) \d+|\b(raiz quadrada|calcule\s*[\d\(]|resolva a equa[cç][aã]o|solve for x|what is \d+\s*[\+\-\*/]))",
        ),
        soft_rule(
            "code_request",
            r"\b(escrev[aeo]|gere|crie|fa[cç]a|write|generate|create)\b.{0,40}\b(c[oó]digo|code|script|fun[cç][aã]o|function|programa (em|que)|program (in|that)|query sql|regex)\b",
        ),
        rule(
            "jokes",
            r"\b(piadas?|conte uma piada|me fa[cç]a rir|charadas?|jokes?|make me laugh)\b",
        ),
        rule(
            "horoscope",
            r"\b(hor[oó]scopo|signos?|astrologia|mapa astral|tar[oô]|horoscope|zodiac)\b",
        ),
        rule(
            "health",
            r"\b(sintomas?|rem[eé]dios?|dieta|emagrecer|doen[cç]as?|dor de (cabe[cç]a|barriga)|diagn[oó]stico|symptoms?|medication|lose weight)\b",
        ),
        soft_rule(
            "travel",
            r"\b(viagem|viajar|passagens? a[eé]reas?|hot[eé]is|pontos tur[ií]sticos|roteiro de (viagem|f[eé]rias)|trip to|flights? to|tourist)\b",
        ),
        rule(
            "relationships",
            r"\b(namorad[oa]s?|namoro|crush|paquera|relacionamento amoroso|ex-namorad[oa]|dating|boyfriend|girlfriend)\b",
        ),
    ]
});

// Each pattern that matches the raw text adds one to the allow score.
static ALLOWLIST: Lazy<Vec<TopicRule>> = Lazy::new(|| {
    vec![
        rule("applications", r"\b(candidaturas?|aplica[cç](ão|ões|oes|ao)|vagas?|applications?|applied)\b"),
        rule("interviews", r"\b(entrevistas?|interviews?|recrutador(a|es)?|recruiters?)\b"),
        rule("offers", r"\b(ofertas?|propostas?|offers?|contrata[cç][aã]o)\b"),
        rule("metrics", r"\b(taxa de resposta|convers[aã]o|estat[ií]sticas?|m[eé]tricas?|response rate|progresso)\b"),
        rule("companies", r"\b(empresas?|companhias?|companies|company|startups?)\b"),
        rule("career", r"\b(carreira|career|curr[ií]culo|resume|cv|linkedin|portf[oó]lio|emprego|trabalho|job)\b"),
        rule("skills", r"\b(habilidades|compet[eê]ncias|skills?|experi[eê]ncia)\b"),
        rule("salary", r"\b(sal[aá]rios?|remunera[cç][aã]o|salary|pretens[aã]o salarial|benef[ií]cios)\b"),
        rule("possessives", r"\b(minhas?|meus?|my)\b"),
        rule("question_words", r"\b(quant[oa]s?|qual|quais|como|quando|onde|por que|porque|how|what|which|when)\b"),
    ]
});

/// Built-in deflection messages returned for off-topic requests.
pub const DEFAULT_DEFLECTIONS: &[&str] = &[
    "Sou um assistente focado na sua busca de emprego. Posso ajudar com suas candidaturas, entrevistas ou propostas?",
    "Esse assunto foge do que eu sei fazer! Que tal conversarmos sobre o andamento das suas candidaturas?",
    "Meu foco é a sua carreira. Quer ajuda para analisar suas vagas, preparar uma entrevista ou revisar suas métricas?",
    "Não consigo ajudar com isso, mas posso te dar um resumo das suas candidaturas ou dicas para a próxima entrevista.",
];

/// Source of randomness for deflection selection.
pub trait ReplySelector: Send + Sync {
    /// Return an index in `0..len`. `len` is never zero.
    fn pick(&self, len: usize) -> usize;
}

/// Uniform selection from the thread-local RNG.
#[derive(Default)]
pub struct ThreadRngSelector;

impl ReplySelector for ThreadRngSelector {
    fn pick(&self, len: usize) -> usize {
        rand::rng().random_range(0..len)
    }
}

/// Deterministic uniform selection for tests and replays.
pub struct SeededSelector {
    rng: Mutex<StdRng>,
}

impl SeededSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ReplySelector for SeededSelector {
    fn pick(&self, len: usize) -> usize {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        rng.random_range(0..len)
    }
}

/// Stateless classifier over the built-in pattern sets plus optional extras.
#[derive(Clone)]
pub struct TopicGuard {
    extra_blocklist: Arc<Vec<Regex>>,
    deflections: Arc<Vec<String>>,
    selector: Arc<dyn ReplySelector>,
}

impl TopicGuard {
    pub fn new(selector: Arc<dyn ReplySelector>) -> Self {
        Self {
            extra_blocklist: Arc::new(Vec::new()),
            deflections: Arc::new(DEFAULT_DEFLECTIONS.iter().map(|s| s.to_string()).collect()),
            selector,
        }
    }

    /// Append operator-supplied blocklist patterns after the built-in ones.
    /// Oversized or invalid patterns are dropped with a warning.
    pub fn with_extra_blocklist(mut self, patterns: &[String]) -> Self {
        let mut compiled = Vec::new();
        if patterns.len() > MAX_EXTRA_PATTERNS {
            tracing::warn!(
                pattern_count = patterns.len(),
                limit = MAX_EXTRA_PATTERNS,
                "extra blocklist truncated"
            );
        }
        for pat in patterns.iter().take(MAX_EXTRA_PATTERNS) {
            if pat.len() > MAX_PATTERN_LEN {
                tracing::warn!(len = pat.len(), limit = MAX_PATTERN_LEN, "dropping oversized blocklist pattern");
                continue;
            }
            match Regex::new(&format!("(?i){pat}")) {
                Ok(re) => compiled.push(re),
                Err(err) => {
                    tracing::warn!(pattern = %pat, error = ?err, "failed to compile blocklist pattern, ignoring");
                }
            }
        }
        self.extra_blocklist = Arc::new(compiled);
        self
    }

    /// Replace the deflection rotation. An empty list keeps the current one.
    pub fn with_deflections(mut self, deflections: &[String]) -> Self {
        if !deflections.is_empty() {
            self.deflections = Arc::new(deflections.to_vec());
        }
        self
    }

    pub fn deflections(&self) -> &[String] {
        &self.deflections
    }

    pub fn classify(&self, text: &str) -> TopicClassification {
        let raw = text.trim();
        let normalized = raw.to_lowercase();
        if normalized.chars().count() < MIN_CLASSIFY_CHARS {
            return TopicClassification::ambiguous(0);
        }

        if let Some(name) = self.blocklist_match(&normalized) {
            return TopicClassification {
                on_topic: false,
                category: TopicCategory::OffTopic,
                confidence: Confidence::High,
                suggested_reply: Some(self.pick_deflection()),
                matched_rule: Some(name),
                allow_matches: 0,
            };
        }

        let allow_matches = ALLOWLIST.iter().filter(|r| r.re.is_match(raw)).count();
        let confidence = match allow_matches {
            0 => return TopicClassification::ambiguous(0),
            1 => Confidence::Medium,
            _ => Confidence::High,
        };
        TopicClassification {
            on_topic: true,
            category: TopicCategory::Career,
            confidence,
            suggested_reply: None,
            matched_rule: None,
            allow_matches,
        }
    }

    fn blocklist_match(&self, normalized: &str) -> Option<&'static str> {
        let careerish = CAREER_VOCABULARY.is_match(normalized);
        if let Some(r) = BLOCKLIST
            .iter()
            .filter(|r| !(r.yields_to_career && careerish))
            .find(|r| r.re.is_match(normalized))
        {
            return Some(r.name);
        }
        self.extra_blocklist
            .iter()
            .any(|re| re.is_match(normalized))
            .then_some("custom")
    }

    fn pick_deflection(&self) -> String {
        let idx = self.selector.pick(self.deflections.len());
        self.deflections[idx.min(self.deflections.len() - 1)].clone()
    }
}

impl Default for TopicGuard {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRngSelector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(usize);

    impl ReplySelector for Fixed {
        fn pick(&self, _len: usize) -> usize {
            self.0
        }
    }

    fn guard() -> TopicGuard {
        TopicGuard::new(Arc::new(SeededSelector::new(7)))
    }

    #[test]
    fn short_input_is_ambiguous_low() {
        let c = guard().classify("   oi tudo   ");
        assert!(c.on_topic);
        assert_eq!(c.category, TopicCategory::Ambiguous);
        assert_eq!(c.confidence, Confidence::Low);
        // Short-circuit wins even over blocklisted vocabulary.
        assert!(guard().classify("piada").on_topic);
    }

    #[test]
    fn geography_question_is_blocked() {
        let c = guard().classify("Qual a capital da França?");
        assert!(!c.on_topic);
        assert_eq!(c.category, TopicCategory::OffTopic);
        assert_eq!(c.confidence, Confidence::High);
        assert_eq!(c.matched_rule, Some("general_knowledge"));
        let reply = c.suggested_reply.unwrap();
        assert!(DEFAULT_DEFLECTIONS.contains(&reply.as_str()));
    }

    #[test]
    fn blocklist_is_deterministic_and_reply_from_fixed_set() {
        let g = TopicGuard::default();
        for _ in 0..50 {
            let c = g.classify("Me conte uma piada sobre programadores");
            assert_eq!(c.category, TopicCategory::OffTopic);
            assert_eq!(c.confidence, Confidence::High);
            assert!(DEFAULT_DEFLECTIONS.contains(&c.suggested_reply.as_deref().unwrap()));
        }
    }

    #[test]
    fn blocklist_categories() {
        let g = guard();
        let cases = [
            ("Qual o melhor filme da Netflix?", "entertainment"),
            ("Me passa uma receita de bolo de cenoura", "recipes"),
            ("quanto é 25 vezes 4 mais 10", "arithmetic"),
            ("12 + 7 * 3 = ?", "arithmetic"),
            ("Escreva um código em Python que ordena uma lista", "code_request"),
            ("Qual o horóscopo de áries hoje?", "horoscope"),
            ("Quais os sintomas de gripe forte?", "health"),
            ("Monte um roteiro de viagem para Lisboa", "travel"),
            ("Como reconquistar minha ex-namorada?", "relationships"),
        ];
        for (text, expected) in cases {
            let c = g.classify(text);
            assert_eq!(c.matched_rule, Some(expected), "text: {text}");
            assert!(!c.on_topic);
        }
    }

    #[test]
    fn first_match_wins_by_order() {
        // Mentions both entertainment and a recipe; entertainment comes first.
        let c = guard().classify("qual filme mostra uma receita de lasanha?");
        assert_eq!(c.matched_rule, Some("entertainment"));
    }

    #[test]
    fn application_count_question_is_career_high() {
        let c = guard().classify("Quantas candidaturas tenho este mes?");
        assert!(c.on_topic);
        assert_eq!(c.category, TopicCategory::Career);
        assert_eq!(c.confidence, Confidence::High);
        assert!(c.allow_matches >= 2);
    }

    #[test]
    fn confidence_tracks_allow_match_count() {
        let g = guard();
        let zero = g.classify("bom dia para voce tambem");
        assert_eq!((zero.category, zero.confidence), (TopicCategory::Ambiguous, Confidence::Low));
        assert_eq!(zero.allow_matches, 0);
        assert!(zero.is_low_confidence_ambiguous());

        let one = g.classify("preciso atualizar o linkedin hoje");
        assert_eq!(one.allow_matches, 1);
        assert_eq!((one.category, one.confidence), (TopicCategory::Career, Confidence::Medium));

        let many = g.classify("Como foi minha taxa de resposta nas entrevistas?");
        assert!(many.allow_matches >= 2);
        assert_eq!((many.category, many.confidence), (TopicCategory::Career, Confidence::High));
    }

    #[test]
    fn career_talk_about_code_interviews_is_not_blocked() {
        let c = guard().classify("Como me preparar para a entrevista técnica da empresa?");
        assert!(c.on_topic);
        assert_eq!(c.category, TopicCategory::Career);
    }

    #[test]
    fn career_questions_with_overlapping_vocabulary_pass() {
        let g = guard();
        for text in [
            "Calcule minha taxa de resposta das candidaturas deste mês",
            "Terminei a entrevista com a Acme, qual o próximo passo?",
            "Em que ano eu me candidatei para a vaga da Acme?",
            "A vaga exige viajar muito, devo aceitar a proposta?",
            "Crie um resumo do programa de trainee da empresa",
        ] {
            let c = g.classify(text);
            assert!(c.on_topic, "text: {text} rule: {:?}", c.matched_rule);
            assert_eq!(c.category, TopicCategory::Career, "text: {text}");
        }
        // Narrowed rules still catch their own topics.
        assert_eq!(g.classify("calcule 15% de 240 por favor").matched_rule, Some("arithmetic"));
        assert_eq!(g.classify("Em que ano foi a queda do muro de Berlim?").matched_rule, Some("general_knowledge"));
        assert_eq!(g.classify("Crie um programa em Rust que lê arquivos").matched_rule, Some("code_request"));
        assert_eq!(g.classify("Quero viajar para a praia no feriado").matched_rule, Some("travel"));
    }

    #[test]
    fn extra_patterns_run_after_builtins() {
        let g = guard()
            .with_extra_blocklist(&["criptomoedas?".to_string(), "(".to_string()])
            .with_deflections(&["Só falo de carreira.".to_string()]);
        let c = g.classify("Devo investir em criptomoeda agora?");
        assert_eq!(c.matched_rule, Some("custom"));
        assert_eq!(c.suggested_reply.as_deref(), Some("Só falo de carreira."));
        // Built-ins still take precedence.
        let c = g.classify("Qual a capital da Itália?");
        assert_eq!(c.matched_rule, Some("general_knowledge"));
    }

    #[test]
    fn selector_drives_reply_choice() {
        let g = TopicGuard::new(Arc::new(Fixed(2)));
        let c = g.classify("Me conte uma piada agora");
        assert_eq!(c.suggested_reply.as_deref(), Some(DEFAULT_DEFLECTIONS[2]));
    }

    #[test]
    fn seeded_selector_is_reproducible() {
        let a = SeededSelector::new(42);
        let b = SeededSelector::new(42);
        let xs: Vec<_> = (0..20).map(|_| a.pick(4)).collect();
        let ys: Vec<_> = (0..20).map(|_| b.pick(4)).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|i| *i < 4));
    }
}
