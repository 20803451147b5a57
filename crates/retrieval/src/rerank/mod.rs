//! Cross-encoder reranking via the relevance oracle
//!
//! Strategies:
//! - relevance-only: one 0-3 relevance judgment
//! - relevance-with-support: adds a parallel 0-1 explicit-evidence judgment
//! - full-analysis: adds a hallucination-risk tag that discounts relevance
//!
//! Judgments run in fixed-size batches with bounded batch concurrency. A
//! failed or malformed judgment falls back to a neutral value
//! (relevance 1.0 of 3, support 0.5) and is reported as a warning.

mod oracle;

pub use oracle::{
    HttpRelevanceOracle, JudgeError, JudgeKind, JudgeRecord, MockRelevanceOracle, RelevanceOracle,
};

use crate::config::RetrievalConfig;
use crate::model::{
    sort_by_score, HallucinationRisk, RetrievalStage, RetrievalWarning, RetrievedChunk, WarningKind,
};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use keystone_common::config::{RerankParams, RerankStrategy};
use keystone_common::metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Neutral relevance when the judge fails (0-3 scale)
pub const FALLBACK_RELEVANCE: f64 = 1.0;

/// Neutral support when the judge fails (0-1 scale)
pub const FALLBACK_SUPPORT: f64 = 0.5;

/// Multiplier when the passage states the answer explicitly
pub const EXPLICIT_EVIDENCE_BONUS: f64 = 1.1;

const MAX_RELEVANCE: f64 = 3.0;

/// Judgments gathered for one chunk
#[derive(Debug, Clone, Default)]
struct Judgment {
    relevance: Option<f64>,
    support: Option<(f64, bool)>,
    risk: Option<HallucinationRisk>,
    failures: Vec<(JudgeKind, JudgeError)>,
}

/// Output of the RERANK stage
#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub judged: usize,
    pub dropped_below_threshold: usize,
    pub warnings: Vec<RetrievalWarning>,
}

/// Reranks the boosted head of the candidate list
pub struct CrossEncoderReranker {
    oracle: Arc<dyn RelevanceOracle>,
}

impl CrossEncoderReranker {
    pub fn new(oracle: Arc<dyn RelevanceOracle>) -> Self {
        Self { oracle }
    }

    /// Rerank `chunks`, which must already be sorted by boosted score
    pub async fn rerank(
        &self,
        query: &str,
        mut chunks: Vec<RetrievedChunk>,
        config: &RetrievalConfig,
        deadline: Option<Instant>,
    ) -> RerankOutcome {
        let params = &config.rerank;

        if params.strategy == RerankStrategy::Disabled {
            chunks.truncate(config.final_top_k);
            return RerankOutcome {
                chunks,
                ..RerankOutcome::default()
            };
        }

        chunks.truncate(params.max_chunks_to_rerank);
        let judged = chunks.len();
        let per_call = config.judge_timeout();

        let strategy = params.strategy;
        let passages: Vec<(usize, String)> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.content.clone()))
            .collect();

        // Batch futures own their passages
        let batches: Vec<_> = passages
            .chunks(params.batch_size)
            .map(move |batch| {
                let batch = batch.to_vec();
                async move {
                    join_all(batch.into_iter().map(move |(i, passage)| async move {
                        let judgment = self
                            .judge_chunk(strategy, query, &passage, per_call, deadline)
                            .await;
                        (i, judgment)
                    }))
                    .await
                }
            })
            .collect();

        let judgments: BTreeMap<usize, Judgment> = stream::iter(batches)
            .buffer_unordered(params.max_concurrent_batches)
            .flat_map(stream::iter)
            .collect()
            .await;

        let mut fallback_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for (i, judgment) in &judgments {
            for (kind, error) in &judgment.failures {
                metrics::record_rerank_fallback(kind.as_str());
                *fallback_counts.entry(kind.as_str()).or_default() += 1;
                tracing::debug!(
                    chunk_id = %chunks[*i].id,
                    judgment = kind.as_str(),
                    error = %error,
                    "Judge fell back to neutral score"
                );
            }
            apply_judgment(&mut chunks[*i], judgment, params);
        }

        let mut warnings = Vec::new();
        if !fallback_counts.is_empty() {
            let detail = fallback_counts
                .iter()
                .map(|(kind, n)| format!("{} {}", n, kind))
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(oracle = self.oracle.name(), fallbacks = %detail, "Rerank used fallback scores");
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Rerank,
                WarningKind::RerankFallback,
                format!("judge failures replaced by neutral scores: {}", detail),
            ));
        }

        let before = chunks.len();
        chunks.retain(|c| c.scores.final_score >= params.min_relevance_score);
        let dropped_below_threshold = before - chunks.len();

        sort_by_score(&mut chunks);
        chunks.truncate(config.final_top_k);

        tracing::debug!(
            strategy = params.strategy.as_str(),
            judged,
            dropped = dropped_below_threshold,
            kept = chunks.len(),
            "Rerank complete"
        );

        RerankOutcome {
            chunks,
            judged,
            dropped_below_threshold,
            warnings,
        }
    }

    async fn judge_chunk(
        &self,
        strategy: RerankStrategy,
        query: &str,
        passage: &str,
        per_call: Duration,
        deadline: Option<Instant>,
    ) -> Judgment {
        let wants_support = matches!(
            strategy,
            RerankStrategy::RelevanceWithSupport | RerankStrategy::FullAnalysis
        );
        let wants_risk = strategy == RerankStrategy::FullAnalysis;

        let (relevance, support, risk) = tokio::join!(
            self.judge_once(JudgeKind::Relevance, query, passage, per_call, deadline),
            async {
                if wants_support {
                    Some(self.judge_once(JudgeKind::Support, query, passage, per_call, deadline).await)
                } else {
                    None
                }
            },
            async {
                if wants_risk {
                    Some(
                        self.judge_once(JudgeKind::HallucinationRisk, query, passage, per_call, deadline)
                            .await,
                    )
                } else {
                    None
                }
            },
        );

        let mut judgment = Judgment::default();
        for result in [Some(relevance), support, risk].into_iter().flatten() {
            match result {
                Ok(JudgeRecord::Relevance { score }) => judgment.relevance = Some(score),
                Ok(JudgeRecord::Support {
                    score,
                    explicit_evidence,
                }) => judgment.support = Some((score, explicit_evidence)),
                Ok(JudgeRecord::HallucinationRisk { risk }) => judgment.risk = Some(risk),
                Err((kind, error)) => judgment.failures.push((kind, error)),
            }
        }
        judgment
    }

    async fn judge_once(
        &self,
        kind: JudgeKind,
        query: &str,
        passage: &str,
        per_call: Duration,
        deadline: Option<Instant>,
    ) -> Result<JudgeRecord, (JudgeKind, JudgeError)> {
        let limit = match deadline {
            Some(deadline) => per_call.min(deadline.saturating_duration_since(Instant::now())),
            None => per_call,
        };
        let timed_out = JudgeError::Timeout(limit.as_millis() as u64);
        if limit.is_zero() {
            return Err((kind, timed_out));
        }

        match tokio::time::timeout(limit, self.oracle.judge(kind, query, passage)).await {
            Ok(Ok(record)) if record.kind() == kind => Ok(record),
            Ok(Ok(record)) => Err((
                kind,
                JudgeError::Malformed(format!("expected {} judgment, got {}", kind.as_str(), record.kind().as_str())),
            )),
            Ok(Err(e)) => Err((kind, e)),
            Err(_) => Err((kind, timed_out)),
        }
    }
}

/// Fold judgments (or their fallbacks) into the chunk's scores
fn apply_judgment(chunk: &mut RetrievedChunk, judgment: &Judgment, params: &RerankParams) {
    let discount = judgment.risk.map_or(1.0, |r| r.discount());
    let relevance = judgment.relevance.unwrap_or(FALLBACK_RELEVANCE) * discount;
    let boosted = chunk.scores.boosted_score;

    let (combined, support, evidence) = match params.strategy {
        RerankStrategy::RelevanceOnly => (
            relevance / MAX_RELEVANCE * (params.relevance_weight + params.support_weight)
                + boosted * params.residual_weight,
            None,
            None,
        ),
        _ => {
            let (support, evidence) = judgment.support.unwrap_or((FALLBACK_SUPPORT, false));
            (
                relevance / MAX_RELEVANCE * params.relevance_weight
                    + support * params.support_weight
                    + boosted * params.residual_weight,
                Some(support),
                Some(evidence),
            )
        }
    };

    let bonus = if evidence == Some(true) {
        EXPLICIT_EVIDENCE_BONUS
    } else {
        1.0
    };

    chunk.scores.rerank_score = Some(relevance);
    chunk.scores.support_score = support;
    chunk.scores.explicit_evidence = evidence;
    chunk.scores.hallucination_risk = judgment.risk;
    chunk.scores.final_score = (combined * bonus).clamp(0.0, 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkSecurity, Clearance, ContentType, ScoreBundle};
    use keystone_common::config::RetrievalParams;

    fn chunk(id: &str, content: &str, boosted: f64) -> RetrievedChunk {
        RetrievedChunk {
            id: id.into(),
            document_id: "doc".into(),
            content: content.into(),
            content_type: ContentType::Text,
            section_path: vec![],
            reading_order: 0,
            page_range: None,
            token_count: 10,
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
                rrf_score: boosted,
                boosted_score: boosted,
                final_score: boosted,
                ..ScoreBundle::default()
            },
            stitched_from: None,
            truncated: false,
        }
    }

    fn config(strategy: RerankStrategy, min_relevance: f64) -> RetrievalConfig {
        let mut params = RetrievalParams::recommended();
        params.rerank.strategy = strategy;
        params.rerank.min_relevance_score = min_relevance;
        params.rerank.batch_size = 2;
        RetrievalConfig::new(params).unwrap()
    }

    fn candidates() -> Vec<RetrievedChunk> {
        vec![
            chunk("a", "The records retention schedule lists durations", 1.0),
            chunk("b", "Records retention policy: keep invoices seven years", 0.9),
            chunk("c", "Cafeteria menu for the week", 0.8),
        ]
    }

    #[tokio::test]
    async fn test_relevance_with_support_reorders_and_bounds_scores() {
        let reranker = CrossEncoderReranker::new(Arc::new(MockRelevanceOracle::new()));
        let outcome = reranker
            .rerank(
                "records retention policy",
                candidates(),
                &config(RerankStrategy::RelevanceWithSupport, 0.0),
                None,
            )
            .await;

        assert_eq!(outcome.judged, 3);
        assert_eq!(outcome.chunks[0].id, "b");
        assert_eq!(outcome.chunks[0].scores.explicit_evidence, Some(true));
        assert!(outcome
            .chunks
            .iter()
            .all(|c| (0.0..=1.0).contains(&c.scores.final_score)));
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_min_relevance_drops_chunks() {
        let reranker = CrossEncoderReranker::new(Arc::new(MockRelevanceOracle::new()));
        let outcome = reranker
            .rerank(
                "records retention policy",
                candidates(),
                &config(RerankStrategy::RelevanceWithSupport, 0.5),
                None,
            )
            .await;

        assert!(outcome.chunks.iter().all(|c| c.scores.final_score >= 0.5));
        assert!(!outcome.chunks.iter().any(|c| c.id == "c"));
        assert_eq!(outcome.dropped_below_threshold, 1);
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_neutral() {
        let oracle = MockRelevanceOracle::new().failing_on(JudgeKind::Support);
        let reranker = CrossEncoderReranker::new(Arc::new(oracle));
        let outcome = reranker
            .rerank(
                "records retention policy",
                candidates(),
                &config(RerankStrategy::RelevanceWithSupport, 0.0),
                None,
            )
            .await;

        assert_eq!(outcome.chunks.len(), 3);
        assert!(outcome.chunks.iter().all(|c| c.scores.support_score == Some(FALLBACK_SUPPORT)));
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::RerankFallback));
    }

    #[tokio::test]
    async fn test_malformed_relevance_uses_documented_fallback() {
        let oracle = MockRelevanceOracle::new().malformed_on(JudgeKind::Relevance);
        let reranker = CrossEncoderReranker::new(Arc::new(oracle));
        let outcome = reranker
            .rerank("anything", candidates(), &config(RerankStrategy::RelevanceOnly, 0.0), None)
            .await;

        for c in &outcome.chunks {
            assert_eq!(c.scores.rerank_score, Some(FALLBACK_RELEVANCE));
            assert_eq!(c.scores.support_score, None);
        }
    }

    #[tokio::test]
    async fn test_full_analysis_discounts_risky_passages() {
        let reranker = CrossEncoderReranker::new(Arc::new(MockRelevanceOracle::new()));
        let outcome = reranker
            .rerank(
                "records retention policy",
                candidates(),
                &config(RerankStrategy::FullAnalysis, 0.0),
                None,
            )
            .await;

        let menu = outcome.chunks.iter().find(|c| c.id == "c").unwrap();
        assert_eq!(menu.scores.hallucination_risk, Some(HallucinationRisk::High));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_oracle_times_out_to_fallback() {
        let reranker = CrossEncoderReranker::new(Arc::new(MockRelevanceOracle::new().hanging()));
        let outcome = reranker
            .rerank("q", candidates(), &config(RerankStrategy::RelevanceOnly, 0.0), None)
            .await;

        assert_eq!(outcome.chunks.len(), 3);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::RerankFallback));
    }

    #[tokio::test]
    async fn test_disabled_only_truncates() {
        let oracle = Arc::new(MockRelevanceOracle::new());
        let reranker = CrossEncoderReranker::new(oracle.clone());
        let mut params = RetrievalParams::recommended();
        params.rerank.strategy = RerankStrategy::Disabled;
        params.final_top_k = 2;
        let config = RetrievalConfig::new(params).unwrap();

        let outcome = reranker.rerank("q", candidates(), &config, None).await;

        assert_eq!(outcome.chunks.len(), 2);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_passage_failure_keeps_others_judged() {
        let oracle = MockRelevanceOracle::new().failing_for_passage("Cafeteria");
        let reranker = CrossEncoderReranker::new(Arc::new(oracle));
        let outcome = reranker
            .rerank(
                "records retention policy",
                candidates(),
                &config(RerankStrategy::RelevanceWithSupport, 0.0),
                None,
            )
            .await;

        let menu = outcome.chunks.iter().find(|c| c.id == "c").unwrap();
        assert_eq!(menu.scores.rerank_score, Some(FALLBACK_RELEVANCE));
        assert_eq!(menu.scores.support_score, Some(FALLBACK_SUPPORT));
        let policy = outcome.chunks.iter().find(|c| c.id == "b").unwrap();
        assert_ne!(policy.scores.rerank_score, Some(FALLBACK_RELEVANCE));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_rerank_future_is_send() {
        fn assert_send<T: Send>(_: T) {}

        let reranker = CrossEncoderReranker::new(Arc::new(MockRelevanceOracle::new()));
        let config = config(RerankStrategy::FullAnalysis, 0.0);
        let query = String::from("q");
        assert_send(reranker.rerank(&query, candidates(), &config, None));
    }

    #[test]
    fn test_combined_score_formula() {
        let params = RetrievalParams::recommended().rerank;
        let mut c = chunk("x", "", 0.8);
        let judgment = Judgment {
            relevance: Some(3.0),
            support: Some((1.0, true)),
            ..Judgment::default()
        };
        apply_judgment(&mut c, &judgment, &params);

        // 1.0*0.6 + 1.0*0.25 + 0.8*0.15 = 0.97, x1.1 clamps to 1.0
        assert_eq!(c.scores.final_score, 1.0);

        let judgment = Judgment {
            relevance: Some(1.5),
            support: Some((0.4, false)),
            risk: Some(HallucinationRisk::Medium),
            failures: vec![],
        };
        apply_judgment(&mut c, &judgment, &params);
        let expected = 1.5 * 0.9 / 3.0 * 0.6 + 0.4 * 0.25 + 0.8 * 0.15;
        assert!((c.scores.final_score - expected).abs() < 1e-12);
    }
}
