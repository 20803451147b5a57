//! Context budget assembly
//!
//! Greedy selection under a token budget. Chunks that do not fit are
//! skipped, not fatal: a smaller chunk further down may still fit. When
//! nothing fits, the best chunk is cut to the budget instead of returning
//! an empty context.

use crate::model::{
    document_order, score_order, RetrievalStage, RetrievalWarning, RetrievedChunk, WarningKind,
};
use keystone_common::config::AssemblyOrder;

/// Output of the BUDGET stage
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub chunks: Vec<RetrievedChunk>,
    pub total_tokens: usize,
    pub omitted: usize,
    pub warnings: Vec<RetrievalWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudgetAssembler {
    max_tokens: usize,
    order: AssemblyOrder,
}

impl ContextBudgetAssembler {
    pub fn new(max_tokens: usize, order: AssemblyOrder) -> Self {
        Self { max_tokens, order }
    }

    pub fn assemble(&self, mut chunks: Vec<RetrievedChunk>) -> AssembledContext {
        if chunks.is_empty() {
            return AssembledContext::default();
        }

        match self.order {
            AssemblyOrder::Score => chunks.sort_by(score_order),
            AssemblyOrder::Document => chunks.sort_by(document_order),
        }

        let candidates = chunks.len();
        let mut total = 0usize;
        let mut selected = Vec::new();
        for chunk in &chunks {
            let next = total.saturating_add(chunk.token_count);
            if next <= self.max_tokens {
                total = next;
                selected.push(chunk.clone());
            }
        }

        let mut warnings = Vec::new();

        if selected.is_empty() {
            // Best chunk regardless of presentation order
            let best = chunks.iter().min_by(|a, b| score_order(a, b)).cloned();
            if let Some(best) = best {
                let cut = truncate_to_budget(best, self.max_tokens);
                tracing::warn!(
                    chunk_id = %cut.id,
                    max_tokens = self.max_tokens,
                    "No chunk fits the context budget; truncated the best chunk"
                );
                warnings.push(RetrievalWarning::new(
                    RetrievalStage::Budget,
                    WarningKind::BudgetTruncated,
                    format!(
                        "no chunk fits {} tokens; chunk {} was truncated to fit",
                        self.max_tokens, cut.id
                    ),
                ));
                total = cut.token_count;
                selected.push(cut);
            }
        }

        let omitted = candidates - selected.len();
        if omitted > 0 {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Budget,
                WarningKind::BudgetTruncated,
                format!("{} chunk(s) omitted to stay within {} tokens", omitted, self.max_tokens),
            ));
        }

        tracing::debug!(
            selected = selected.len(),
            omitted,
            total_tokens = total,
            "Context assembled"
        );

        AssembledContext {
            chunks: selected,
            total_tokens: total,
            omitted,
            warnings,
        }
    }
}

/// Cut content to roughly `max_tokens` (4 bytes per token) on a char boundary
pub(crate) fn truncate_to_budget(mut chunk: RetrievedChunk, max_tokens: usize) -> RetrievedChunk {
    let max_bytes = max_tokens.saturating_mul(4);
    if chunk.content.len() > max_bytes {
        let mut end = max_bytes;
        while end > 0 && !chunk.content.is_char_boundary(end) {
            end -= 1;
        }
        chunk.content.truncate(end);
    }
    chunk.token_count = chunk.token_count.min(max_tokens);
    chunk.truncated = true;
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkSecurity, Clearance, ContentType, ScoreBundle};

    fn chunk(id: &str, doc: &str, order: u32, tokens: usize, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            id: id.into(),
            document_id: doc.into(),
            content: "é".repeat(tokens * 2),
            content_type: ContentType::Text,
            section_path: vec![],
            reading_order: order,
            page_range: None,
            token_count: tokens,
            updated_at: None,
            security: ChunkSecurity {
                tenant_id: "acme".into(),
                active: true,
                sensitivity: Clearance::Public,
                allowed_users: vec![],
                allowed_groups: vec![],
                department: None,
            },
            attributes: Default::default(),
            scores: ScoreBundle {
                final_score: score,
                ..ScoreBundle::default()
            },
            stitched_from: None,
            truncated: false,
        }
    }

    #[test]
    fn test_greedy_skips_oversized_chunks() {
        let assembler = ContextBudgetAssembler::new(100, AssemblyOrder::Score);
        let out = assembler.assemble(vec![
            chunk("a", "d", 1, 60, 0.9),
            chunk("b", "d", 2, 70, 0.8),
            chunk("c", "d", 3, 30, 0.7),
        ]);

        let ids: Vec<_> = out.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(out.total_tokens, 90);
        assert_eq!(out.omitted, 1);
    }

    #[test]
    fn test_document_order() {
        let assembler = ContextBudgetAssembler::new(1000, AssemblyOrder::Document);
        let out = assembler.assemble(vec![
            chunk("late", "d1", 9, 10, 0.9),
            chunk("other", "d0", 5, 10, 0.1),
            chunk("early", "d1", 1, 10, 0.5),
        ]);
        let ids: Vec<_> = out.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["other", "early", "late"]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_truncates_best_chunk_when_nothing_fits() {
        let assembler = ContextBudgetAssembler::new(10, AssemblyOrder::Score);
        let out = assembler.assemble(vec![chunk("small", "d", 1, 50, 0.4), chunk("best", "d", 2, 80, 0.9)]);

        assert_eq!(out.chunks.len(), 1);
        let best = &out.chunks[0];
        assert_eq!(best.id, "best");
        assert!(best.truncated);
        assert!(best.content.len() <= 40);
        assert_eq!(best.token_count, 10);
        assert!(out.warnings.iter().any(|w| w.kind == WarningKind::BudgetTruncated));
    }

    #[test]
    fn test_huge_token_counts_do_not_overflow() {
        let mut huge = chunk("huge", "d", 2, 1, 0.5);
        huge.token_count = usize::MAX;
        let assembler = ContextBudgetAssembler::new(100, AssemblyOrder::Score);
        let out = assembler.assemble(vec![chunk("a", "d", 1, 60, 0.9), huge]);

        let ids: Vec<_> = out.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(out.total_tokens, 60);
        assert_eq!(out.omitted, 1);
    }

    #[test]
    fn test_empty_input() {
        let out = ContextBudgetAssembler::new(10, AssemblyOrder::Score).assemble(vec![]);
        assert!(out.chunks.is_empty());
        assert!(out.warnings.is_empty());
    }
}
