//! Message classification.
//!
//! The classifier is an opaque pure function from the pipeline's point of
//! view; the trait is the seam where a real NLU service plugs in. The
//! shipped implementation is a deterministic keyword matcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Greeting,
    Scheduling,
    Information,
    Qualification,
    Handoff,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Greeting => "greeting",
            Category::Scheduling => "scheduling",
            Category::Information => "information",
            Category::Qualification => "qualification",
            Category::Handoff => "handoff",
            Category::General => "general",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub confidence: f32,
    pub subcategory: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifyError>;
}

/// Keyword matcher over lowercased text, pt-BR vocabulary.
///
/// An explicit request for a human outranks everything; greeting is checked
/// last so "bom dia, quero agendar" routes to scheduling, not greeting.
pub struct KeywordClassifier;

const HANDOFF: &[&str] = &[
    "atendente",
    "humano",
    "falar com alguém",
    "falar com alguem",
    "pessoa de verdade",
    "reclamação",
    "reclamacao",
];

const SCHEDULING: &[&str] = &[
    "agendar",
    "marcar",
    "consulta",
    "horário",
    "horario",
    "disponibilidade",
    "tem vaga",
    "remarcar",
];

const INFORMATION: &[&str] = &[
    "como funciona",
    "o que é",
    "o que e",
    "quanto custa",
    "preço",
    "preco",
    "valor",
    "dúvida",
    "duvida",
    "informação",
    "informacao",
];

const QUALIFICATION: &[&str] = &[
    "meu filho",
    "minha filha",
    "anos",
    "está no",
    "esta no",
    "nome é",
    "nome e",
    "estuda",
    "escola",
];

const GREETING: &[&str] = &[
    "oi",
    "olá",
    "ola",
    "bom dia",
    "boa tarde",
    "boa noite",
    "hello",
];

const MATCH_CONFIDENCE: f32 = 0.85;
const FALLBACK_CONFIDENCE: f32 = 0.3;

fn find_keyword(text: &str, keywords: &[&str]) -> Option<String> {
    keywords
        .iter()
        .find(|kw| text.contains(*kw))
        .map(|kw| kw.to_string())
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifyError> {
        let lower = text.to_lowercase();
        let tables: &[(Category, &[&str])] = &[
            (Category::Handoff, HANDOFF),
            (Category::Scheduling, SCHEDULING),
            (Category::Information, INFORMATION),
            (Category::Qualification, QUALIFICATION),
            (Category::Greeting, GREETING),
        ];

        for (category, keywords) in tables {
            if let Some(matched) = find_keyword(&lower, keywords) {
                return Ok(Classification {
                    category: *category,
                    confidence: MATCH_CONFIDENCE,
                    subcategory: Some(matched),
                });
            }
        }

        Ok(Classification {
            category: Category::General,
            confidence: FALLBACK_CONFIDENCE,
            subcategory: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn classify(text: &str) -> Classification {
        KeywordClassifier.classify(text).await.unwrap()
    }

    #[tokio::test]
    async fn greeting_is_recognised() {
        let c = classify("Oi, tudo bem?").await;
        assert_eq!(c.category, Category::Greeting);
        assert!(c.confidence > 0.5);
        assert_eq!(c.subcategory.as_deref(), Some("oi"));
    }

    #[tokio::test]
    async fn scheduling_outranks_greeting() {
        let c = classify("Bom dia, quero agendar uma visita").await;
        assert_eq!(c.category, Category::Scheduling);
    }

    #[tokio::test]
    async fn handoff_outranks_everything() {
        let c = classify("quero falar com alguém para agendar").await;
        assert_eq!(c.category, Category::Handoff);
    }

    #[tokio::test]
    async fn unknown_text_falls_back_with_low_confidence() {
        let c = classify("xyzzy plugh").await;
        assert_eq!(c.category, Category::General);
        assert!(c.confidence < 0.5);
        assert!(c.subcategory.is_none());
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let a = classify("quanto custa a mensalidade?").await;
        let b = classify("quanto custa a mensalidade?").await;
        assert_eq!(a.category, b.category);
        assert_eq!(a.category, Category::Information);
        assert_eq!(a.subcategory, b.subcategory);
    }
}
