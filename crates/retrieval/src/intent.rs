//! Query Intent Router - classifies a query and tunes retrieval for it
//!
//! Classification is rule-based. Patterns are tested in a fixed precedence
//! order and the first match wins:
//!
//! 1. comparative / table lookup
//! 2. figure understanding
//! 3. procedural
//! 4. troubleshooting
//! 5. definition
//! 6. factual
//! 7. general (fallback)

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Query intent classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// "what is X", "define X"
    Definition,
    /// How-to and step-by-step requests
    Procedural,
    /// Comparisons and table lookups
    ComparativeTable,
    /// Questions about figures, charts, diagrams
    FigureUnderstanding,
    /// Errors, failures, fixes
    Troubleshooting,
    /// Who/when/where style lookups
    Factual,
    /// Unknown/general
    General,
}

/// Intent-specific adjustments applied on top of the base configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentOverride {
    /// (vector_weight, lexical_weight), always summing to 1.0
    pub weights: Option<(f64, f64)>,
    pub table_boost: Option<f64>,
    pub image_boost: Option<f64>,
    /// Multiplier on vector_k and lexical_top
    pub breadth: f64,
    pub final_top_k: Option<usize>,
}

impl IntentOverride {
    const NONE: IntentOverride = IntentOverride {
        weights: None,
        table_boost: None,
        image_boost: None,
        breadth: 1.0,
        final_top_k: None,
    };
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Definition => "definition",
            QueryIntent::Procedural => "procedural",
            QueryIntent::ComparativeTable => "comparative_table",
            QueryIntent::FigureUnderstanding => "figure_understanding",
            QueryIntent::Troubleshooting => "troubleshooting",
            QueryIntent::Factual => "factual",
            QueryIntent::General => "general",
        }
    }

    /// Static override lookup table
    pub fn override_profile(&self) -> IntentOverride {
        match self {
            QueryIntent::Definition => IntentOverride {
                weights: Some((0.5, 0.5)),
                breadth: 0.8,
                final_top_k: Some(6),
                ..IntentOverride::NONE
            },
            QueryIntent::Procedural => IntentOverride {
                weights: Some((0.6, 0.4)),
                final_top_k: Some(12),
                ..IntentOverride::NONE
            },
            QueryIntent::ComparativeTable => IntentOverride {
                weights: Some((0.4, 0.6)),
                table_boost: Some(1.5),
                breadth: 1.2,
                ..IntentOverride::NONE
            },
            QueryIntent::FigureUnderstanding => IntentOverride {
                weights: Some((0.7, 0.3)),
                image_boost: Some(1.5),
                ..IntentOverride::NONE
            },
            QueryIntent::Troubleshooting => IntentOverride {
                weights: Some((0.5, 0.5)),
                breadth: 1.2,
                ..IntentOverride::NONE
            },
            QueryIntent::Factual => IntentOverride {
                weights: Some((0.5, 0.5)),
                final_top_k: Some(8),
                ..IntentOverride::NONE
            },
            QueryIntent::General => IntentOverride::NONE,
        }
    }

    /// Suffix appended by the query expander, if any
    pub fn expansion_suffix(&self) -> Option<&'static str> {
        match self {
            QueryIntent::Definition => Some("definition"),
            QueryIntent::Procedural => Some("steps"),
            QueryIntent::ComparativeTable => Some("comparison table"),
            QueryIntent::FigureUnderstanding => Some("figure diagram"),
            QueryIntent::Troubleshooting => Some("troubleshooting resolution"),
            QueryIntent::Factual | QueryIntent::General => None,
        }
    }
}

/// Classification outcome
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutedIntent {
    pub intent: QueryIntent,
    pub overrides: IntentOverride,
}

/// Rule-based intent router
pub struct QueryIntentRouter {
    rules: Vec<(QueryIntent, Regex)>,
}

// Precedence order is part of the contract: first match wins.
const RULES: &[(QueryIntent, &str)] = &[
    (
        QueryIntent::ComparativeTable,
        r"(?i)\b(compare|compared|comparison|comparing|versus|vs|difference between|differences between|table|pros and cons|which is (better|cheaper|faster))\b",
    ),
    (
        QueryIntent::FigureUnderstanding,
        r"(?i)\b(figure|fig|diagram|chart|graph|image|picture|illustration|screenshot|flowchart)\b",
    ),
    (
        QueryIntent::Procedural,
        r"(?i)(^\s*how (to|do|can|should)\b)|\b(steps|step by step|procedure|instructions|set up|setup|configure|install)\b",
    ),
    (
        QueryIntent::Definition,
        r"(?i)(^\s*(what is|what are|what's|define|definition of|meaning of)\b)|\bwhat does .+ mean\b",
    ),
    (
        QueryIntent::Factual,
        r"(?i)^\s*(who|when|where|which|how many|how much|is there|are there|list)\b",
    ),
    (
        QueryIntent::Troubleshooting,
        r"(?i)\b(error|errors|fail|fails|failed|failing|failure|not working|broken|troubleshoot|troubleshooting|crash|crashes|exception)\b",
    ),
];

impl QueryIntentRouter {
    /// Create a new router with the built-in rule table
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|(intent, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*intent, re)),
                Err(e) => {
                    tracing::error!(intent = intent.as_str(), error = %e, "Invalid intent pattern");
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// Classify a query; first matching rule wins
    pub fn classify(&self, query: &str) -> QueryIntent {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(query))
            .map(|(intent, _)| *intent)
            .unwrap_or(QueryIntent::General)
    }

    /// Classify and attach the intent's override profile
    pub fn route(&self, query: &str) -> RoutedIntent {
        let intent = self.classify(query);
        tracing::debug!(intent = intent.as_str(), "Query routed");
        RoutedIntent {
            intent,
            overrides: intent.override_profile(),
        }
    }
}

impl Default for QueryIntentRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(q: &str) -> QueryIntent {
        QueryIntentRouter::new().classify(q)
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(QueryIntentRouter::new().rules.len(), RULES.len());
    }

    #[test]
    fn test_definition_intent() {
        assert_eq!(classify("what is the retention policy"), QueryIntent::Definition);
        assert_eq!(classify("Define data steward"), QueryIntent::Definition);
    }

    #[test]
    fn test_procedural_intent() {
        assert_eq!(classify("How do I request PTO?"), QueryIntent::Procedural);
        assert_eq!(classify("steps to rotate the vpn certificate"), QueryIntent::Procedural);
    }

    #[test]
    fn test_comparison_beats_figure_and_procedural() {
        assert_eq!(
            classify("how to compare the diagram in plan A vs plan B"),
            QueryIntent::ComparativeTable
        );
    }

    #[test]
    fn test_figure_beats_definition() {
        assert_eq!(classify("what is shown in figure 3"), QueryIntent::FigureUnderstanding);
    }

    #[test]
    fn test_procedural_beats_troubleshooting() {
        assert_eq!(classify("how to fix the sync error"), QueryIntent::Procedural);
        assert_eq!(classify("sync error after upgrade"), QueryIntent::Troubleshooting);
    }

    #[test]
    fn test_definition_and_factual_beat_troubleshooting() {
        assert_eq!(classify("what is error 500"), QueryIntent::Definition);
        assert_eq!(classify("when did the export job fail"), QueryIntent::Factual);
        assert_eq!(classify("export job failed overnight"), QueryIntent::Troubleshooting);
    }

    #[test]
    fn test_factual_and_general() {
        assert_eq!(classify("who owns the expense policy"), QueryIntent::Factual);
        assert_eq!(classify("quarterly roadmap"), QueryIntent::General);
    }

    #[test]
    fn test_word_boundaries() {
        // "timetable" must not trigger the table rule
        assert_eq!(classify("office timetable"), QueryIntent::General);
    }

    #[test]
    fn test_override_weights_sum_to_one() {
        for intent in [
            QueryIntent::Definition,
            QueryIntent::Procedural,
            QueryIntent::ComparativeTable,
            QueryIntent::FigureUnderstanding,
            QueryIntent::Troubleshooting,
            QueryIntent::Factual,
            QueryIntent::General,
        ] {
            if let Some((v, l)) = intent.override_profile().weights {
                assert!((v + l - 1.0).abs() < 1e-9, "{:?}", intent);
            }
        }
    }
}
