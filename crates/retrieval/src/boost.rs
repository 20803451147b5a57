//! Structural boosting
//!
//! Multiplies the fused score by content-type/intent affinity, recency, and
//! the index's semantic-ranker hint. All factors are multiplicative, so the
//! order they are applied in does not matter.

use crate::config::RetrievalConfig;
use crate::intent::QueryIntent;
use crate::model::{sort_by_score, ContentType, RetrievedChunk};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StructuralBooster {
    table_boost: f64,
    image_boost: f64,
    recency_boost: f64,
    recency_window_days: u32,
    semantic_hint_weight: f64,
}

impl StructuralBooster {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            table_boost: config.table_boost,
            image_boost: config.image_boost,
            recency_boost: config.recency_boost,
            recency_window_days: config.recency_window_days,
            semantic_hint_weight: config.semantic_hint_weight,
        }
    }

    /// Combined multiplier for one chunk
    pub fn multiplier(&self, chunk: &RetrievedChunk, intent: QueryIntent, now: DateTime<Utc>) -> f64 {
        let mut factor = match (chunk.content_type, intent) {
            (ContentType::Table, QueryIntent::ComparativeTable) => self.table_boost,
            (ContentType::ImageCaption, QueryIntent::FigureUnderstanding) => self.image_boost,
            _ => 1.0,
        };

        if self.recency_window_days > 0 {
            let window = Duration::days(i64::from(self.recency_window_days));
            if chunk.updated_at.is_some_and(|at| at <= now && now - at <= window) {
                factor *= self.recency_boost;
            }
        }

        if let Some(hint) = chunk.scores.semantic_score {
            factor *= 1.0 + hint.clamp(0.0, 1.0) * self.semantic_hint_weight;
        }

        factor
    }

    /// Boost every chunk in place and re-sort by the boosted score
    pub fn apply(&self, chunks: &mut [RetrievedChunk], intent: QueryIntent, now: DateTime<Utc>) {
        for chunk in chunks.iter_mut() {
            let boosted = chunk.scores.rrf_score * self.multiplier(chunk, intent, now);
            chunk.scores.boosted_score = boosted;
            chunk.scores.final_score = boosted;
        }
        sort_by_score(chunks);
    }
}
