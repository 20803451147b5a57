//! Weighted Reciprocal Rank Fusion (RRF)
//!
//! Each (variant, modality) list contributes `weight(modality) / (rrf_k + rank)`
//! per chunk, summed by chunk id. Fused scores are then divided by the
//! maximum so the top chunk scores 1.0.
//!
//! RRF:
//! - Doesn't require score normalization across modalities
//! - Is robust to outliers in any single list

use crate::config::RetrievalConfig;
use crate::model::{sort_by_score, RetrievedChunk};
use crate::search::{Modality, RankedList};
use std::collections::HashMap;

/// RRF fusion parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankFusionEngine {
    /// Smoothing constant k (typically 60)
    pub k: f64,

    /// Weight for vector lists
    pub vector_weight: f64,

    /// Weight for lexical lists
    pub lexical_weight: f64,
}

struct Accumulated {
    chunk: RetrievedChunk,
    fused: f64,
}

impl RankFusionEngine {
    pub fn new(k: f64, vector_weight: f64, lexical_weight: f64) -> Self {
        Self {
            k,
            vector_weight,
            lexical_weight,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.rrf_k, config.vector_weight, config.lexical_weight)
    }

    fn weight(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Vector => self.vector_weight,
            Modality::Lexical => self.lexical_weight,
        }
    }

    /// Contribution of one hit at a 1-based rank
    pub fn contribution(&self, modality: Modality, rank: usize) -> f64 {
        self.weight(modality) / (self.k + rank as f64)
    }

    /// Unnormalized fused score per chunk id
    pub fn raw_scores(&self, lists: &[RankedList]) -> HashMap<String, f64> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        for list in canonical_order(lists) {
            for hit in &list.hits {
                *scores.entry(hit.row.id.clone()).or_default() += self.contribution(list.modality, hit.rank);
            }
        }
        scores
    }

    /// Fuse ranked lists into one chunk set sorted by normalized RRF score
    pub fn fuse(&self, lists: &[RankedList]) -> Vec<RetrievedChunk> {
        let mut merged: HashMap<String, Accumulated> = HashMap::new();

        // Summation order is fixed, so arrival order cannot change the sums
        for list in canonical_order(lists) {
            for hit in &list.hits {
                let contribution = self.contribution(list.modality, hit.rank);
                let entry = merged.entry(hit.row.id.clone()).or_insert_with(|| Accumulated {
                    chunk: RetrievedChunk::from_row(&hit.row),
                    fused: 0.0,
                });
                entry.fused += contribution;

                let raw = hit.row.score;
                let slot = match list.modality {
                    Modality::Vector => &mut entry.chunk.scores.vector_score,
                    Modality::Lexical => &mut entry.chunk.scores.lexical_score,
                };
                *slot = Some(slot.map_or(raw, |best| best.max(raw)));
            }
        }

        let max = merged.values().map(|a| a.fused).fold(0.0_f64, f64::max);

        let mut chunks: Vec<RetrievedChunk> = merged
            .into_values()
            .map(|Accumulated { mut chunk, fused }| {
                let normalized = if max > 0.0 { fused / max } else { 0.0 };
                chunk.scores.rrf_score = normalized;
                chunk.scores.final_score = normalized;
                chunk
            })
            .collect();

        sort_by_score(&mut chunks);

        tracing::debug!(
            lists = lists.len(),
            chunks = chunks.len(),
            max_fused = max,
            "Rank fusion complete"
        );

        chunks
    }
}

fn canonical_order(lists: &[RankedList]) -> Vec<&RankedList> {
    let mut ordered: Vec<&RankedList> = lists.iter().collect();
    ordered.sort_by(|a, b| (a.variant_index, a.modality).cmp(&(b.variant_index, b.modality)));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkSecurity, Clearance, ContentType};
    use crate::search::{IndexRow, RankedHit};
    use rand::seq::SliceRandom;

    fn row(id: &str, score: f64) -> IndexRow {
        IndexRow {
            id: id.into(),
            document_id: "doc".into(),
            content: format!("content of {}", id),
            score,
            content_type: ContentType::Text,
            section_path: vec![],
            reading_order: 0,
            page_range: None,
            token_count: None,
            updated_at: None,
            semantic_score: None,
            security: ChunkSecurity {
                tenant_id: "acme".into(),
                active: true,
                sensitivity: Clearance::Public,
                allowed_users: vec![],
                allowed_groups: vec![],
                department: None,
            },
            attributes: Default::default(),
        }
    }

    fn list(variant_index: usize, modality: Modality, ids: &[&str]) -> RankedList {
        RankedList {
            variant_index,
            modality,
            hits: ids
                .iter()
                .enumerate()
                .map(|(i, id)| RankedHit {
                    rank: i + 1,
                    row: row(id, 1.0 / (i + 1) as f64),
                })
                .collect(),
        }
    }

    fn engine() -> RankFusionEngine {
        RankFusionEngine::new(60.0, 0.6, 0.4)
    }

    #[test]
    fn test_exact_weighted_contribution() {
        let lists = vec![
            list(0, Modality::Vector, &["c1", "c2"]),
            list(1, Modality::Lexical, &["c3", "c4", "c1"]),
        ];

        let raw = engine().raw_scores(&lists);
        let expected = 0.6 * (1.0 / 61.0) + 0.4 * (1.0 / 63.0);
        assert!((raw["c1"] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_top_result_normalized_to_one() {
        let lists = vec![
            list(0, Modality::Vector, &["a", "b", "c"]),
            list(0, Modality::Lexical, &["b", "a"]),
        ];
        let fused = engine().fuse(&lists);

        assert_eq!(fused[0].scores.rrf_score, 1.0);
        assert!(fused.iter().all(|c| c.scores.rrf_score > 0.0 && c.scores.rrf_score <= 1.0));
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_raw_modality_scores_kept() {
        let lists = vec![
            list(0, Modality::Vector, &["a", "b"]),
            list(1, Modality::Vector, &["b"]),
        ];
        let fused = engine().fuse(&lists);
        let b = fused.iter().find(|c| c.id == "b").unwrap();

        assert_eq!(b.scores.vector_score, Some(1.0));
        assert_eq!(b.scores.lexical_score, None);
    }

    #[test]
    fn test_commutative_under_shuffle() {
        let mut lists = vec![
            list(0, Modality::Vector, &["a", "b", "c", "d"]),
            list(0, Modality::Lexical, &["d", "a", "e"]),
            list(1, Modality::Vector, &["b", "a", "f"]),
            list(1, Modality::Lexical, &["e", "c"]),
            list(2, Modality::Vector, &["f", "d", "b"]),
        ];
        let baseline = engine().fuse(&lists);

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            lists.shuffle(&mut rng);
            let shuffled = engine().fuse(&lists);
            assert_eq!(baseline.len(), shuffled.len());
            for (x, y) in baseline.iter().zip(&shuffled) {
                assert_eq!(x.id, y.id);
                assert!((x.scores.rrf_score - y.scores.rrf_score).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_empty_lists() {
        assert!(engine().fuse(&[]).is_empty());
    }
}
