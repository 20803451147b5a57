//! Query Expander - produces a small, ordered set of query variants
//!
//! Variant order:
//! 1. the original query (never dropped)
//! 2. abbreviation-expanded query
//! 3. intent-suffixed original and expanded queries
//! 4. keyword-only query (stop words removed)
//!
//! Variants are deduplicated case-insensitively, first occurrence wins.

use crate::config::MAX_QUERY_VARIANTS;
use crate::intent::QueryIntent;
use std::collections::{HashMap, HashSet};

/// Query expander with an abbreviation dictionary
pub struct QueryExpander {
    /// Abbreviation -> expansion (keys lowercase)
    abbreviations: HashMap<String, String>,

    /// Stop words to filter from the keyword variant
    stop_words: HashSet<&'static str>,
}

impl QueryExpander {
    /// Create an expander with the built-in enterprise abbreviations
    pub fn new() -> Self {
        Self {
            abbreviations: Self::load_default_abbreviations(),
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }

    /// Add or replace abbreviations
    pub fn with_abbreviations<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (abbr, expansion) in entries {
            self.abbreviations
                .insert(abbr.into().to_lowercase(), expansion.into());
        }
        self
    }

    /// Produce at most `max_variants` (capped at 6) variants, original first
    pub fn expand(&self, query: &str, intent: QueryIntent, max_variants: usize) -> Vec<String> {
        let limit = max_variants.clamp(1, MAX_QUERY_VARIANTS);
        let original = normalize_whitespace(query);

        let expanded = self.expand_abbreviations(&original);
        let mut candidates = vec![original.clone(), expanded.clone()];

        if let Some(suffix) = intent.expansion_suffix() {
            candidates.push(with_suffix(&original, suffix));
            candidates.push(with_suffix(&expanded, suffix));
        }

        let keywords = self.keywords(&expanded);
        if !keywords.is_empty() {
            candidates.push(keywords);
        }

        let mut seen = HashSet::new();
        let variants: Vec<String> = candidates
            .into_iter()
            .filter(|v| !v.is_empty())
            .filter(|v| seen.insert(v.to_lowercase()))
            .take(limit)
            .collect();

        tracing::debug!(
            intent = intent.as_str(),
            variants = variants.len(),
            "Query expanded"
        );

        variants
    }

    /// Replace known abbreviations, keeping surrounding punctuation
    fn expand_abbreviations(&self, query: &str) -> String {
        query
            .split_whitespace()
            .map(|token| {
                let core = token.trim_matches(|c: char| !c.is_alphanumeric());
                match self.abbreviations.get(&core.to_lowercase()) {
                    Some(expansion) if !core.is_empty() => token.replacen(core, expansion, 1),
                    _ => token.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Content words only, for the lexical side
    fn keywords(&self, query: &str) -> String {
        query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .filter(|w| !self.stop_words.contains(w.to_lowercase().as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn load_default_abbreviations() -> HashMap<String, String> {
        [
            ("hr", "human resources"),
            ("pto", "paid time off"),
            ("sla", "service level agreement"),
            ("kpi", "key performance indicator"),
            ("okr", "objectives and key results"),
            ("sso", "single sign-on"),
            ("mfa", "multi-factor authentication"),
            ("vpn", "virtual private network"),
            ("pii", "personally identifiable information"),
            ("gdpr", "general data protection regulation"),
            ("nda", "non-disclosure agreement"),
            ("sow", "statement of work"),
            ("rfp", "request for proposal"),
            ("faq", "frequently asked questions"),
            ("roi", "return on investment"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

impl Default for QueryExpander {
    fn default() -> Self {
        Self::new()
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been",
    "in", "on", "at", "to", "for", "of", "with", "by", "from",
    "and", "or", "but", "not", "this", "that", "these", "those",
    "it", "its", "as", "do", "does", "did", "has", "have", "had",
    "can", "could", "will", "would", "should", "may", "might",
    "what", "how", "i", "we", "my", "our",
];

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn with_suffix(query: &str, suffix: &str) -> String {
    let trimmed = query.trim_end_matches(|c: char| c == '?' || c == '.' || c == '!');
    format!("{} {}", trimmed, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_first() {
        let expander = QueryExpander::new();
        let variants = expander.expand("How do I request PTO?", QueryIntent::Procedural, 6);

        assert_eq!(variants[0], "How do I request PTO?");
        assert!(variants.contains(&"How do I request paid time off?".to_string()));
        assert!(variants.contains(&"How do I request PTO steps".to_string()));
        assert!(variants.len() <= 6);
    }

    #[test]
    fn test_case_insensitive_dedup() {
        let expander = QueryExpander::new();
        let variants = expander.expand("Quarterly Roadmap", QueryIntent::General, 6);

        // no abbreviation and no suffix: expanded and keyword variants collapse into the original
        assert_eq!(variants, vec!["Quarterly Roadmap".to_string()]);
    }

    #[test]
    fn test_limit_respected_and_original_kept() {
        let expander = QueryExpander::new();
        let variants = expander.expand("what is the sla for hr tickets", QueryIntent::Definition, 2);

        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0], "what is the sla for hr tickets");
        assert_eq!(
            variants[1],
            "what is the service level agreement for human resources tickets"
        );
    }

    #[test]
    fn test_limit_capped_at_six() {
        let expander = QueryExpander::new();
        let variants = expander.expand("how to reset mfa on the vpn", QueryIntent::Procedural, 50);
        assert!(variants.len() <= MAX_QUERY_VARIANTS);
        assert_eq!(variants[0], "how to reset mfa on the vpn");
    }

    #[test]
    fn test_custom_abbreviation() {
        let expander = QueryExpander::new().with_abbreviations([("CAB", "change advisory board")]);
        let variants = expander.expand("cab schedule", QueryIntent::General, 6);
        assert_eq!(variants[1], "change advisory board schedule");
    }

    #[test]
    fn test_keyword_variant() {
        let expander = QueryExpander::new();
        let variants = expander.expand("what is the retention policy", QueryIntent::Definition, 6);
        assert_eq!(
            variants,
            vec![
                "what is the retention policy".to_string(),
                "what is the retention policy definition".to_string(),
                "retention policy".to_string(),
            ]
        );
    }
}
