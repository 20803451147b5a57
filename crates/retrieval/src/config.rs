//! Validated retrieval configuration
//!
//! `RetrievalConfig` can only be obtained through [`RetrievalConfig::new`],
//! so a request never sees an invalid weight sum or a non-positive budget.

use crate::intent::IntentOverride;
use keystone_common::config::{RerankStrategy, RetrievalParams};
use keystone_common::errors::{AppError, Result};
use std::ops::Deref;
use std::time::Duration;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Hard cap on query variants per request
pub const MAX_QUERY_VARIANTS: usize = 6;

/// Immutable, validated retrieval tunables
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    params: RetrievalParams,
}

impl RetrievalConfig {
    /// Validate raw parameters
    pub fn new(params: RetrievalParams) -> Result<Self> {
        validate(&params)?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.params.search_timeout_ms)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.params.rerank.judge_timeout_ms)
    }

    pub fn rerank_enabled(&self) -> bool {
        self.params.rerank.strategy != RerankStrategy::Disabled
    }

    /// Apply an intent-specific override, re-validating the result
    pub fn with_override(&self, over: &IntentOverride) -> Result<Self> {
        let mut params = self.params.clone();

        if let Some((vector_weight, lexical_weight)) = over.weights {
            params.vector_weight = vector_weight;
            params.lexical_weight = lexical_weight;
        }
        if let Some(table_boost) = over.table_boost {
            params.table_boost = table_boost;
        }
        if let Some(image_boost) = over.image_boost {
            params.image_boost = image_boost;
        }
        params.vector_k = scale(params.vector_k, over.breadth);
        params.lexical_top = scale(params.lexical_top, over.breadth);
        if let Some(final_top_k) = over.final_top_k {
            params.final_top_k = final_top_k;
        }

        Self::new(params)
    }
}

impl Deref for RetrievalConfig {
    type Target = RetrievalParams;

    fn deref(&self) -> &Self::Target {
        &self.params
    }
}

impl TryFrom<RetrievalParams> for RetrievalConfig {
    type Error = AppError;

    fn try_from(params: RetrievalParams) -> Result<Self> {
        Self::new(params)
    }
}

fn scale(value: usize, factor: f64) -> usize {
    ((value as f64 * factor).round() as usize).max(1)
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::configuration(message)
}

fn validate(p: &RetrievalParams) -> Result<()> {
    if p.vector_k == 0 || p.lexical_top == 0 || p.final_top_k == 0 {
        return Err(invalid("vector_k, lexical_top and final_top_k must be positive"));
    }
    if p.vector_weight < 0.0 || p.lexical_weight < 0.0 {
        return Err(invalid("fusion weights must be non-negative"));
    }
    if (p.vector_weight + p.lexical_weight - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(invalid(format!(
            "vector_weight + lexical_weight must equal 1.0 (got {})",
            p.vector_weight + p.lexical_weight
        )));
    }
    if !(p.rrf_k > 0.0 && p.rrf_k.is_finite()) {
        return Err(invalid("rrf_k must be a positive number"));
    }
    for (name, boost) in [
        ("table_boost", p.table_boost),
        ("image_boost", p.image_boost),
        ("recency_boost", p.recency_boost),
    ] {
        if !(boost > 0.0 && boost.is_finite()) {
            return Err(invalid(format!("{} must be positive", name)));
        }
    }
    if !(p.semantic_hint_weight >= 0.0 && p.semantic_hint_weight.is_finite()) {
        return Err(invalid("semantic_hint_weight must be non-negative"));
    }
    if p.max_acl_group_predicate_size == 0 {
        return Err(invalid("max_acl_group_predicate_size must be positive"));
    }
    if p.max_query_variants == 0 || p.max_query_variants > MAX_QUERY_VARIANTS {
        return Err(invalid(format!(
            "max_query_variants must be between 1 and {}",
            MAX_QUERY_VARIANTS
        )));
    }
    if p.search_concurrency == 0 {
        return Err(invalid("search_concurrency must be positive"));
    }
    if p.search_timeout_ms == 0 {
        return Err(invalid("search_timeout_ms must be positive"));
    }
    if p.max_context_tokens == 0 {
        return Err(invalid("max_context_tokens must be positive"));
    }

    let r = &p.rerank;
    if r.max_chunks_to_rerank == 0 || r.batch_size == 0 || r.max_concurrent_batches == 0 {
        return Err(invalid(
            "rerank max_chunks_to_rerank, batch_size and max_concurrent_batches must be positive",
        ));
    }
    if r.judge_timeout_ms == 0 {
        return Err(invalid("rerank judge_timeout_ms must be positive"));
    }
    if !(0.0..=1.0).contains(&r.min_relevance_score) {
        return Err(invalid("rerank min_relevance_score must lie in [0, 1]"));
    }
    if r.relevance_weight < 0.0 || r.support_weight < 0.0 || r.residual_weight < 0.0 {
        return Err(invalid("rerank weights must be non-negative"));
    }
    let rerank_sum = r.relevance_weight + r.support_weight + r.residual_weight;
    if (rerank_sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(invalid(format!(
            "rerank relevance + support + residual weights must equal 1.0 (got {})",
            rerank_sum
        )));
    }

    let s = &p.stitch;
    if !(s.neighbor_discount > 0.0 && s.neighbor_discount <= 1.0) {
        return Err(invalid("stitch neighbor_discount must lie in (0, 1]"));
    }
    if s.max_total_tokens == 0 {
        return Err(invalid("stitch max_total_tokens must be positive"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::QueryIntent;

    #[test]
    fn test_recommended_is_valid() {
        assert!(RetrievalConfig::new(RetrievalParams::recommended()).is_ok());
    }

    #[test]
    fn test_bad_weight_sum_rejected() {
        let mut params = RetrievalParams::recommended();
        params.vector_weight = 0.7;
        params.lexical_weight = 0.4;
        let err = RetrievalConfig::new(params).unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut params = RetrievalParams::recommended();
        params.max_context_tokens = 0;
        assert!(RetrievalConfig::new(params).is_err());

        let mut params = RetrievalParams::recommended();
        params.stitch.max_total_tokens = 0;
        assert!(RetrievalConfig::new(params).is_err());
    }

    #[test]
    fn test_variant_cap_enforced() {
        let mut params = RetrievalParams::recommended();
        params.max_query_variants = 7;
        assert!(RetrievalConfig::new(params).is_err());
    }

    #[test]
    fn test_rerank_weights_must_sum_to_one() {
        let mut params = RetrievalParams::recommended();
        params.rerank.residual_weight = 0.5;
        assert!(RetrievalConfig::new(params).is_err());
    }

    #[test]
    fn test_override_scales_breadth_and_weights() {
        let base = RetrievalConfig::new(RetrievalParams::recommended()).unwrap();
        let over = QueryIntent::ComparativeTable.override_profile();
        let tuned = base.with_override(&over).unwrap();

        assert_eq!(tuned.vector_k, 60);
        assert!((tuned.vector_weight + tuned.lexical_weight - 1.0).abs() < 1e-9);
        assert!(tuned.table_boost > base.table_boost);
    }
}
