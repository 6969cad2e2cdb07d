//! Routing: classification → target node + action.

use serde::Serialize;

use crate::classify::{Category, Classification};

/// Confidence below this falls back to a clarification response.
const FALLBACK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Proceed,
    Escalate,
    Fallback,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::Proceed => "proceed",
            RouteAction::Escalate => "escalate",
            RouteAction::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub target: &'static str,
    pub action: RouteAction,
    pub final_confidence: f32,
}

/// Pure decision function. Handoff requests escalate regardless of
/// confidence; anything the classifier is unsure about falls back.
pub fn route(classification: &Classification) -> RouteDecision {
    if classification.category == Category::Handoff {
        return RouteDecision {
            target: "human_handoff",
            action: RouteAction::Escalate,
            final_confidence: classification.confidence,
        };
    }

    if classification.confidence < FALLBACK_THRESHOLD {
        return RouteDecision {
            target: "clarification",
            action: RouteAction::Fallback,
            final_confidence: classification.confidence,
        };
    }

    RouteDecision {
        target: classification.category.as_str(),
        action: RouteAction::Proceed,
        final_confidence: classification.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(category: Category, confidence: f32) -> Classification {
        Classification {
            category,
            confidence,
            subcategory: None,
        }
    }

    #[test]
    fn confident_classification_proceeds_to_its_node() {
        let decision = route(&classification(Category::Scheduling, 0.85));
        assert_eq!(decision.action, RouteAction::Proceed);
        assert_eq!(decision.target, "scheduling");
        assert_eq!(decision.final_confidence, 0.85);
    }

    #[test]
    fn low_confidence_falls_back() {
        let decision = route(&classification(Category::General, 0.3));
        assert_eq!(decision.action, RouteAction::Fallback);
        assert_eq!(decision.target, "clarification");
    }

    #[test]
    fn handoff_escalates_even_at_low_confidence() {
        let decision = route(&classification(Category::Handoff, 0.2));
        assert_eq!(decision.action, RouteAction::Escalate);
        assert_eq!(decision.target, "human_handoff");
    }
}
