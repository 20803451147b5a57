//! Neighbor Stitcher - widens retained chunks with adjacent context
//!
//! Provides:
//! - Same-section neighbor lookup by reading order
//! - Structural-type boundaries (a table never pulls in prose)
//! - Token budget management across the stitched set
//! - Presentation ordering by (document, reading order)

use crate::acl::AclFilterResult;
use crate::budget::truncate_to_budget;
use crate::config::RetrievalConfig;
use crate::model::{
    document_order, score_order, RetrievalStage, RetrievalWarning, RetrievedChunk, ScoreBundle, WarningKind,
};
use crate::search::{IndexRow, SearchIndex};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Output of the STITCH stage
#[derive(Debug, Clone, Default)]
pub struct StitchOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub neighbors_added: usize,
    pub total_tokens: usize,
    pub warnings: Vec<RetrievalWarning>,
}

/// Pulls adjacent same-section chunks around each anchor
pub struct NeighborStitcher {
    index: Arc<dyn SearchIndex>,
}

impl NeighborStitcher {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    pub async fn stitch(
        &self,
        anchors: Vec<RetrievedChunk>,
        acl: &AclFilterResult,
        config: &RetrievalConfig,
    ) -> StitchOutcome {
        let params = &config.stitch;
        if !params.enabled || params.max_neighbors == 0 || anchors.is_empty() {
            let total_tokens = anchors.iter().map(|c| c.token_count).sum();
            return StitchOutcome {
                chunks: anchors,
                total_tokens,
                ..StitchOutcome::default()
            };
        }

        let budget = params.max_total_tokens;
        let mut warnings = Vec::new();

        // Anchors claim the budget first, best score first
        let mut ordered = anchors;
        ordered.sort_by(score_order);
        let mut total = 0usize;
        let mut selected = Vec::with_capacity(ordered.len());
        let mut dropped = 0usize;
        for anchor in ordered.iter() {
            let next = total.saturating_add(anchor.token_count);
            if next <= budget {
                total = next;
                selected.push(anchor.clone());
            } else {
                dropped += 1;
            }
        }

        if selected.is_empty() {
            // Nothing fits whole: keep the best anchor, cut to the budget, unstitched
            let candidates = ordered.len();
            let Some(best) = ordered.into_iter().next() else {
                return StitchOutcome::default();
            };
            let cut = truncate_to_budget(best, budget);
            tracing::warn!(budget, anchors = candidates, chunk_id = %cut.id, "No anchor fits the stitch budget");
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Stitch,
                WarningKind::StitchSkipped,
                format!(
                    "no chunk fits the stitch budget of {} tokens; chunk {} was truncated and {} dropped",
                    budget,
                    cut.id,
                    candidates - 1
                ),
            ));
            return StitchOutcome {
                total_tokens: cut.token_count,
                chunks: vec![cut],
                warnings,
                ..StitchOutcome::default()
            };
        }
        if dropped > 0 {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Stitch,
                WarningKind::StitchTruncated,
                format!("{} chunk(s) did not fit the stitch budget of {} tokens", dropped, budget),
            ));
        }

        let radius = params.max_neighbors as u32;
        let lookups = join_all(selected.iter().map(|anchor| {
            let from = anchor.reading_order.saturating_sub(radius);
            let to = anchor.reading_order.saturating_add(radius);
            self.index
                .neighbors(&anchor.document_id, &anchor.section_path, from..=to, &acl.predicate)
        }))
        .await;

        let mut included: HashSet<String> = selected.iter().map(|c| c.id.clone()).collect();
        let mut stitched: Vec<RetrievedChunk> = Vec::new();
        let mut failed_lookups = 0usize;
        let mut budget_hit = false;

        for (anchor, lookup) in selected.iter().zip(lookups) {
            let rows = match lookup {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(chunk_id = %anchor.id, error = %e, "Neighbor lookup failed");
                    failed_lookups += 1;
                    continue;
                }
            };

            let by_order: HashMap<u32, &IndexRow> = rows
                .iter()
                .filter(|row| acl.permits(row))
                .map(|row| (row.reading_order, row))
                .collect();

            let mut added = 0usize;
            let mut open = [true, true];
            'walk: for distance in 1..=radius {
                for (direction, is_open) in open.iter_mut().enumerate() {
                    if !*is_open || added >= params.max_neighbors {
                        continue;
                    }
                    let order = if direction == 0 {
                        anchor.reading_order.checked_add(distance)
                    } else {
                        anchor.reading_order.checked_sub(distance)
                    };
                    let Some(row) = order.and_then(|o| by_order.get(&o)) else {
                        *is_open = false;
                        continue;
                    };
                    if !same_run(anchor, row) {
                        *is_open = false;
                        continue;
                    }
                    if included.contains(&row.id) {
                        continue;
                    }

                    let neighbor = neighbor_of(anchor, row, params.neighbor_discount);
                    let next = total.saturating_add(neighbor.token_count);
                    if next > budget {
                        budget_hit = true;
                        break 'walk;
                    }
                    total = next;
                    included.insert(neighbor.id.clone());
                    stitched.push(neighbor);
                    added += 1;
                }
            }
        }

        if failed_lookups > 0 {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Stitch,
                WarningKind::StitchSkipped,
                format!("neighbor lookup failed for {} chunk(s)", failed_lookups),
            ));
        }
        if budget_hit {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Stitch,
                WarningKind::StitchTruncated,
                format!("neighbor stitching stopped at the {} token budget", budget),
            ));
        }

        let neighbors_added = stitched.len();
        let mut chunks = selected;
        chunks.extend(stitched);
        chunks.sort_by(document_order);

        tracing::debug!(
            anchors = chunks.len() - neighbors_added,
            neighbors_added,
            total_tokens = total,
            "Neighbor stitching complete"
        );

        StitchOutcome {
            chunks,
            neighbors_added,
            total_tokens: total,
            warnings,
        }
    }
}

/// Same document, same section, same structural type
fn same_run(anchor: &RetrievedChunk, row: &IndexRow) -> bool {
    row.document_id == anchor.document_id
        && row.section_path == anchor.section_path
        && row.content_type == anchor.content_type
        && row.security.tenant_id == anchor.security.tenant_id
}

fn neighbor_of(anchor: &RetrievedChunk, row: &IndexRow, discount: f64) -> RetrievedChunk {
    let mut chunk = RetrievedChunk::from_row(row);
    chunk.scores = ScoreBundle {
        semantic_score: row.semantic_score,
        final_score: anchor.scores.final_score * discount,
        ..ScoreBundle::default()
    };
    chunk.stitched_from = Some(anchor.id.clone());
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclFilterBuilder;
    use crate::audit::MemoryAuditSink;
    use crate::model::{ChunkSecurity, Clearance, ContentType, SecurityIdentity};
    use crate::search::{MockSearchIndex, PredicateCapacity};
    use keystone_common::config::RetrievalParams;

    fn row(id: &str, order: u32, content_type: ContentType, tokens: usize) -> IndexRow {
        IndexRow {
            id: id.into(),
            document_id: "handbook".into(),
            content: format!("chunk {}", id),
            score: 0.0,
            content_type,
            section_path: vec!["Leave".into()],
            reading_order: order,
            page_range: None,
            token_count: Some(tokens),
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

    fn anchor(r: &IndexRow, score: f64) -> RetrievedChunk {
        let mut chunk = RetrievedChunk::from_row(r);
        chunk.scores.final_score = score;
        chunk
    }

    fn acl() -> AclFilterResult {
        let identity = SecurityIdentity::new("alice", "acme", Vec::<String>::new(), Clearance::Internal);
        AclFilterBuilder::new(128, PredicateCapacity::Unlimited, Arc::new(MemoryAuditSink::new()))
            .plan(&identity, &[])
            .unwrap()
    }

    fn config(max_neighbors: usize, budget: usize) -> RetrievalConfig {
        let mut params = RetrievalParams::recommended();
        params.stitch.max_neighbors = max_neighbors;
        params.stitch.max_total_tokens = budget;
        RetrievalConfig::new(params).unwrap()
    }

    fn corpus() -> Vec<IndexRow> {
        vec![
            row("c1", 1, ContentType::Text, 10),
            row("c2", 2, ContentType::Text, 10),
            row("c3", 3, ContentType::Text, 10),
            row("c4", 4, ContentType::Text, 10),
            row("t5", 5, ContentType::Table, 10),
            row("c6", 6, ContentType::Text, 10),
        ]
    }

    #[tokio::test]
    async fn test_neighbors_respect_type_boundary() {
        let rows = corpus();
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));

        let outcome = stitcher.stitch(vec![anchor(&rows[3], 0.9)], &acl(), &config(2, 1000)).await;
        let ids: Vec<_> = outcome.chunks.iter().map(|c| c.id.as_str()).collect();

        // c4's upward run stops at the table; the downward run supplies both neighbors
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
        for c in outcome.chunks.iter().filter(|c| c.is_neighbor()) {
            assert_eq!(c.content_type, ContentType::Text);
            assert_eq!(c.stitched_from.as_deref(), Some("c4"));
            assert!((c.scores.final_score - 0.9 * 0.8).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn test_budget_never_exceeded() {
        let rows = corpus();
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));

        let outcome = stitcher.stitch(vec![anchor(&rows[2], 0.9)], &acl(), &config(2, 25)).await;

        assert_eq!(outcome.neighbors_added, 1);
        assert!(outcome.total_tokens <= 25);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::StitchTruncated));
    }

    #[tokio::test]
    async fn test_anchors_are_not_duplicated() {
        let rows = corpus();
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));

        let outcome = stitcher
            .stitch(vec![anchor(&rows[1], 0.9), anchor(&rows[2], 0.8)], &acl(), &config(1, 1000))
            .await;
        let ids: Vec<_> = outcome.chunks.iter().map(|c| c.id.as_str()).collect();

        assert_eq!(ids, vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_disabled_passthrough() {
        let rows = corpus();
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));
        let mut params = RetrievalParams::recommended();
        params.stitch.enabled = false;
        let config = RetrievalConfig::new(params).unwrap();

        let outcome = stitcher.stitch(vec![anchor(&rows[0], 0.5)], &acl(), &config).await;
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.neighbors_added, 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_keeps_anchor() {
        let rows = corpus();
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone()).failing_all()));

        let outcome = stitcher.stitch(vec![anchor(&rows[0], 0.5)], &acl(), &config(2, 1000)).await;
        assert_eq!(outcome.chunks.len(), 1);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::StitchSkipped));
    }

    #[tokio::test]
    async fn test_oversized_anchors_keep_best_within_budget() {
        let rows = vec![row("a", 1, ContentType::Text, 50), row("b", 9, ContentType::Text, 50)];
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));

        let outcome = stitcher
            .stitch(vec![anchor(&rows[0], 0.4), anchor(&rows[1], 0.9)], &acl(), &config(2, 40))
            .await;

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].id, "b");
        assert!(outcome.chunks[0].truncated);
        assert!(outcome.total_tokens <= 40);
        assert_eq!(outcome.neighbors_added, 0);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::StitchSkipped));
    }

    #[tokio::test]
    async fn test_huge_neighbor_token_count_stops_the_walk() {
        let mut rows = corpus();
        rows[1].token_count = Some(usize::MAX);
        let stitcher = NeighborStitcher::new(Arc::new(MockSearchIndex::new(rows.clone())));

        let outcome = stitcher.stitch(vec![anchor(&rows[2], 0.9)], &acl(), &config(2, 1000)).await;

        let ids: Vec<_> = outcome.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c4"]);
        assert_eq!(outcome.total_tokens, 20);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::StitchTruncated));
    }
}
